use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{EventDeadLetters, InsertionId};
use crate::error::EventBusError;
use crate::event::Event;
use crate::group::Group;

/// In-process dead letters, lost on restart.
pub struct MemoryEventDeadLetters<E> {
    entries: RwLock<HashMap<Group, Vec<(InsertionId, E)>>>,
}

impl<E> MemoryEventDeadLetters<E> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<E> Default for MemoryEventDeadLetters<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Event> EventDeadLetters<E> for MemoryEventDeadLetters<E> {
    async fn store(&self, group: &Group, event: &E) -> Result<InsertionId, EventBusError> {
        let id = InsertionId::random();
        self.entries
            .write()
            .await
            .entry(group.clone())
            .or_default()
            .push((id, event.clone()));
        Ok(id)
    }

    async fn remove(&self, group: &Group, id: InsertionId) -> Result<(), EventBusError> {
        let mut entries = self.entries.write().await;
        if let Some(events) = entries.get_mut(group) {
            events.retain(|(stored, _)| *stored != id);
            if events.is_empty() {
                entries.remove(group);
            }
        }
        Ok(())
    }

    async fn remove_group(&self, group: &Group) -> Result<(), EventBusError> {
        self.entries.write().await.remove(group);
        Ok(())
    }

    async fn failed_event(
        &self,
        group: &Group,
        id: InsertionId,
    ) -> Result<Option<E>, EventBusError> {
        Ok(self.entries.read().await.get(group).and_then(|events| {
            events
                .iter()
                .find(|(stored, _)| *stored == id)
                .map(|(_, event)| event.clone())
        }))
    }

    async fn failed_ids(&self, group: &Group) -> Result<Vec<InsertionId>, EventBusError> {
        Ok(self
            .entries
            .read()
            .await
            .get(group)
            .map(|events| events.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    async fn groups_with_failed_events(&self) -> Result<Vec<Group>, EventBusError> {
        let mut groups: Vec<Group> = self.entries.read().await.keys().cloned().collect();
        groups.sort();
        Ok(groups)
    }

    async fn contain_events(&self) -> Result<bool, EventBusError> {
        Ok(!self.entries.read().await.is_empty())
    }
}
