use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, info};

use super::{EventDeadLetters, InsertionId};
use crate::error::EventBusError;
use crate::event::Event;
use crate::group::Group;
use crate::naming::EventBusName;
use crate::serializer::EventSerializer;

// Redis stream entries with binary field values
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;

/// Dead letters persisted in Redis.
///
/// Each group is a stream (insertion order) plus an index hash from
/// insertion id to stream entry id. A set tracks groups that ever had entries.
pub struct RedisEventDeadLetters<E: Event> {
    redis: ConnectionManager,
    serializer: Arc<dyn EventSerializer<E>>,
    prefix: String,
}

impl<E: Event> RedisEventDeadLetters<E> {
    pub fn new(
        redis: ConnectionManager,
        name: &EventBusName,
        serializer: Arc<dyn EventSerializer<E>>,
    ) -> Self {
        Self {
            redis,
            serializer,
            prefix: format!("eventbus:{name}:dead-letters"),
        }
    }

    fn groups_key(&self) -> String {
        format!("{}:groups", self.prefix)
    }

    fn stream_key(&self, group: &Group) -> String {
        format!("{}:group:{}", self.prefix, group.as_str())
    }

    fn index_key(&self, group: &Group) -> String {
        format!("{}:index:{}", self.prefix, group.as_str())
    }

    async fn stream_id_of(
        &self,
        group: &Group,
        id: InsertionId,
    ) -> Result<Option<String>, EventBusError> {
        let mut conn = self.redis.clone();
        Ok(redis::cmd("HGET")
            .arg(self.index_key(group))
            .arg(id.to_string())
            .query_async::<Option<String>>(&mut conn)
            .await?)
    }
}

fn field<'a>(fields: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_slice())
}

#[async_trait]
impl<E: Event> EventDeadLetters<E> for RedisEventDeadLetters<E> {
    async fn store(&self, group: &Group, event: &E) -> Result<InsertionId, EventBusError> {
        let id = InsertionId::random();
        let payload = self.serializer.to_bytes(event)?;
        let mut conn = self.redis.clone();

        let stream_id: String = redis::cmd("XADD")
            .arg(self.stream_key(group))
            .arg("*")
            .arg("insertion_id")
            .arg(id.to_string())
            .arg("event")
            .arg(payload)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await?;

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.index_key(group))
            .arg(id.to_string())
            .arg(&stream_id)
            .ignore()
            .cmd("SADD")
            .arg(self.groups_key())
            .arg(group.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(
            group = %group,
            insertion_id = %id,
            event_id = %event.event_id(),
            "Stored event in dead letters"
        );

        Ok(id)
    }

    async fn remove(&self, group: &Group, id: InsertionId) -> Result<(), EventBusError> {
        let Some(stream_id) = self.stream_id_of(group, id).await? else {
            return Ok(());
        };
        let mut conn = self.redis.clone();

        redis::pipe()
            .atomic()
            .cmd("XDEL")
            .arg(self.stream_key(group))
            .arg(&stream_id)
            .ignore()
            .cmd("HDEL")
            .arg(self.index_key(group))
            .arg(id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(group = %group, insertion_id = %id, "Removed dead letter");
        Ok(())
    }

    async fn remove_group(&self, group: &Group) -> Result<(), EventBusError> {
        let mut conn = self.redis.clone();

        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.stream_key(group))
            .arg(self.index_key(group))
            .ignore()
            .cmd("SREM")
            .arg(self.groups_key())
            .arg(group.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(group = %group, "Removed all dead letters of group");
        Ok(())
    }

    async fn failed_event(
        &self,
        group: &Group,
        id: InsertionId,
    ) -> Result<Option<E>, EventBusError> {
        let Some(stream_id) = self.stream_id_of(group, id).await? else {
            return Ok(None);
        };
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(self.stream_key(group))
            .arg(&stream_id)
            .arg(&stream_id)
            .query_async(&mut conn)
            .await?;

        match entries.first().and_then(|(_, fields)| field(fields, "event")) {
            Some(payload) => Ok(Some(self.serializer.from_bytes(payload)?)),
            None => Ok(None),
        }
    }

    async fn failed_ids(&self, group: &Group) -> Result<Vec<InsertionId>, EventBusError> {
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(self.stream_key(group))
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        let mut ids = Vec::with_capacity(entries.len());
        for (_stream_id, fields) in entries {
            if let Some(raw) = field(&fields, "insertion_id")
                && let Ok(raw) = std::str::from_utf8(raw)
                && let Ok(id) = raw.parse::<InsertionId>()
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn groups_with_failed_events(&self) -> Result<Vec<Group>, EventBusError> {
        let mut conn = self.redis.clone();

        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.groups_key())
            .query_async(&mut conn)
            .await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for name in &names {
            pipe.cmd("XLEN").arg(self.stream_key(&Group::new(name.as_str())));
        }
        let lengths: Vec<u64> = pipe.query_async(&mut conn).await?;

        let mut groups: Vec<Group> = names
            .into_iter()
            .zip(lengths)
            .filter(|(_, len)| *len > 0)
            .map(|(name, _)| Group::new(name))
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn contain_events(&self) -> Result<bool, EventBusError> {
        Ok(!self.groups_with_failed_events().await?.is_empty())
    }
}
