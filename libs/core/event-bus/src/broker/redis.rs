//! Redis-backed broker for multi-instance deployments.
//!
//! Layout under the `eventbus:broker` prefix:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `exchanges` | SET | declared exchanges |
//! | `binding:{exchange}:{routing key}` | SET | bound queues |
//! | `queue:{q}:meta` | HASH | queue options |
//! | `queue:{q}:bindings` | SET | `exchange\x1frouting key` pairs |
//! | `queue:{q}:ready` | LIST | message ids ready for delivery |
//! | `queue:{q}:delayed` | ZSET | expiring message ids scored by deadline |
//! | `delayed-queues` | SET | queues that ever parked expiring messages |
//! | `msg:{id}` | HASH | routing key, payload, retry count |
//! | `consumers` | HASH | consumer tag -> queue |
//! | `consumer:{tag}:inflight` | LIST | delivered, unsettled message ids |
//! | `consumer:{tag}:alive` | STRING | heartbeat with expiry |
//!
//! Messages carrying an expiration are parked in the delayed set until their
//! deadline, then dead-lettered by a background sweeper. The sweeper also
//! returns in-flight messages of consumers whose heartbeat lapsed.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Broker, Consumer, DEFAULT_EXCHANGE, DeadLetterTarget, Delivery, OutboundMessage, QueueOptions,
};
use crate::error::EventBusError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_TTL: Duration = Duration::from_secs(10);
const SWEEP_BATCH: usize = 100;
const BINDING_SEPARATOR: char = '\x1f';

/// Broker keeping exchanges, queues and messages in Redis.
#[derive(Clone)]
pub struct RedisBroker {
    store: Store,
    consumers: Arc<Mutex<HashMap<String, ConsumerHandle>>>,
    _sweeper: Arc<watch::Sender<bool>>,
}

struct ConsumerHandle {
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl RedisBroker {
    /// Connect to Redis and start the expiry sweeper.
    pub async fn connect(url: &str) -> Result<Self, EventBusError> {
        info!("Connecting event bus broker to Redis");
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self::new(manager))
    }

    /// Use an existing connection. Must be called within a tokio runtime.
    pub fn new(redis: ConnectionManager) -> Self {
        let store = Store {
            redis,
            prefix: "eventbus:broker".to_string(),
        };
        let (sweeper_tx, sweeper_rx) = watch::channel(false);
        tokio::spawn(run_sweeper(store.clone(), sweeper_rx));

        Self {
            store,
            consumers: Arc::new(Mutex::new(HashMap::new())),
            _sweeper: Arc::new(sweeper_tx),
        }
    }

    fn release_permit(&self, consumer_tag: &str) {
        let consumers = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = consumers.get(consumer_tag) {
            handle.permits.add_permits(1);
        }
    }
}

/// Key layout and the command sequences shared by the broker and its tasks.
#[derive(Clone)]
struct Store {
    redis: ConnectionManager,
    prefix: String,
}

impl Store {
    fn exchanges(&self) -> String {
        format!("{}:exchanges", self.prefix)
    }

    fn binding(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}:binding:{exchange}:{routing_key}", self.prefix)
    }

    fn meta(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:meta", self.prefix)
    }

    fn queue_bindings(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:bindings", self.prefix)
    }

    fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:ready", self.prefix)
    }

    fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:delayed", self.prefix)
    }

    fn delayed_queues(&self) -> String {
        format!("{}:delayed-queues", self.prefix)
    }

    fn message(&self, id: &str) -> String {
        format!("{}:msg:{id}", self.prefix)
    }

    fn consumers(&self) -> String {
        format!("{}:consumers", self.prefix)
    }

    fn inflight(&self, consumer_tag: &str) -> String {
        format!("{}:consumer:{consumer_tag}:inflight", self.prefix)
    }

    fn alive(&self, consumer_tag: &str) -> String {
        format!("{}:consumer:{consumer_tag}:alive", self.prefix)
    }

    async fn queue_options(&self, queue: &str) -> Result<Option<QueueOptions>, EventBusError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.meta(queue))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let flag = |name: &str| fields.get(name).is_some_and(|v| v == "1");
        Ok(Some(QueueOptions {
            durable: flag("durable"),
            exclusive: flag("exclusive"),
            auto_delete: flag("auto_delete"),
            dead_letter: fields.get("dlx").map(|exchange| DeadLetterTarget {
                exchange: exchange.clone(),
                routing_key: fields.get("dlrk").cloned(),
            }),
        }))
    }

    async fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, EventBusError> {
        let mut conn = self.redis.clone();
        if exchange == DEFAULT_EXCHANGE {
            let exists: bool = redis::cmd("EXISTS")
                .arg(self.meta(routing_key))
                .query_async(&mut conn)
                .await?;
            return Ok(if exists {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let declared: bool = redis::cmd("SISMEMBER")
            .arg(self.exchanges())
            .arg(exchange)
            .query_async(&mut conn)
            .await?;
        if !declared {
            return Err(EventBusError::exchange_not_found(exchange));
        }

        let mut queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.binding(exchange, routing_key))
            .query_async(&mut conn)
            .await?;
        queues.sort();
        Ok(queues)
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), EventBusError> {
        let targets = self.route(exchange, &message.routing_key).await?;
        if targets.is_empty() {
            debug!(exchange, routing_key = %message.routing_key, "Dropped unroutable message");
            return Ok(());
        }

        let deadline = message
            .expiration
            .map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for queue in &targets {
            let id = Uuid::new_v4().to_string();
            pipe.cmd("HSET")
                .arg(self.message(&id))
                .arg("routing_key")
                .arg(&message.routing_key)
                .arg("payload")
                .arg(message.payload.as_slice())
                .arg("retry_count")
                .arg(message.retry_count)
                .ignore();
            match deadline {
                Some(deadline) => {
                    pipe.cmd("ZADD")
                        .arg(self.delayed(queue))
                        .arg(deadline)
                        .arg(&id)
                        .ignore()
                        .cmd("SADD")
                        .arg(self.delayed_queues())
                        .arg(queue)
                        .ignore();
                }
                None => {
                    pipe.cmd("RPUSH").arg(self.ready(queue)).arg(&id).ignore();
                }
            }
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Republish a stored message to its queue's dead-letter target, then drop it.
    async fn dead_letter(&self, queue: &str, id: &str) -> Result<(), EventBusError> {
        let target = self.queue_options(queue).await?.and_then(|o| o.dead_letter);
        if let Some(target) = target
            && let Some(stored) = self.load(id).await?
        {
            let message = OutboundMessage {
                routing_key: target.routing_key.unwrap_or(stored.routing_key),
                payload: stored.payload,
                retry_count: stored.retry_count,
                expiration: None,
            };
            self.publish(&target.exchange, message).await?;
        }

        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(self.message(id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<StoredMessage>, EventBusError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(self.message(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let text = |name: &str| {
            fields
                .get(name)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()
        };
        Ok(Some(StoredMessage {
            routing_key: text("routing_key"),
            payload: fields.get("payload").cloned().unwrap_or_default(),
            retry_count: text("retry_count").parse().unwrap_or(0),
        }))
    }

    /// Move the next ready message of `queue` to the consumer's in-flight list.
    async fn fetch(&self, queue: &str, consumer_tag: &str) -> Result<Option<Delivery>, EventBusError> {
        let mut conn = self.redis.clone();
        loop {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(self.ready(queue))
                .arg(self.inflight(consumer_tag))
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            let Some(id) = id else {
                return Ok(None);
            };

            match self.load(&id).await? {
                Some(stored) => {
                    return Ok(Some(Delivery {
                        delivery_tag: id,
                        consumer_tag: consumer_tag.to_string(),
                        queue: queue.to_string(),
                        routing_key: stored.routing_key,
                        payload: stored.payload,
                        retry_count: stored.retry_count,
                    }));
                }
                None => {
                    // message body deleted with its queue
                    redis::cmd("LREM")
                        .arg(self.inflight(consumer_tag))
                        .arg(1)
                        .arg(&id)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
            }
        }
    }

    /// Put an in-flight message back at the head of its queue.
    async fn return_to_queue(&self, delivery: &Delivery) -> Result<(), EventBusError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.inflight(&delivery.consumer_tag))
            .arg(1)
            .arg(&delivery.delivery_tag)
            .ignore()
            .cmd("LPUSH")
            .arg(self.ready(&delivery.queue))
            .arg(&delivery.delivery_tag)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), EventBusError> {
        let mut conn = self.redis.clone();
        let bindings: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.queue_bindings(queue))
            .query_async(&mut conn)
            .await?;
        let mut ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.ready(queue))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.delayed(queue))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        ids.extend(delayed);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for binding in &bindings {
            if let Some((exchange, routing_key)) = binding.split_once(BINDING_SEPARATOR) {
                pipe.cmd("SREM")
                    .arg(self.binding(exchange, routing_key))
                    .arg(queue)
                    .ignore();
            }
        }
        for id in &ids {
            pipe.cmd("DEL").arg(self.message(id)).ignore();
        }
        pipe.cmd("DEL")
            .arg(self.meta(queue))
            .arg(self.queue_bindings(queue))
            .arg(self.ready(queue))
            .arg(self.delayed(queue))
            .ignore()
            .cmd("SREM")
            .arg(self.delayed_queues())
            .arg(queue)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        debug!(queue, "Deleted queue");
        Ok(())
    }

    async fn has_consumers(&self, queue: &str) -> Result<bool, EventBusError> {
        let mut conn = self.redis.clone();
        let queues: Vec<String> = redis::cmd("HVALS")
            .arg(self.consumers())
            .query_async(&mut conn)
            .await?;
        Ok(queues.iter().any(|q| q == queue))
    }

    async fn delete_if_unused(&self, queue: &str) -> Result<(), EventBusError> {
        let auto_delete = self
            .queue_options(queue)
            .await?
            .is_some_and(|o| o.auto_delete);
        if auto_delete && !self.has_consumers(queue).await? {
            self.delete_queue(queue).await?;
        }
        Ok(())
    }

    /// Dead-letter expired messages of every queue with parked messages.
    async fn sweep_expired(&self) -> Result<(), EventBusError> {
        let mut conn = self.redis.clone();
        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.delayed_queues())
            .query_async(&mut conn)
            .await?;
        let now = Utc::now().timestamp_millis();

        for queue in queues {
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.delayed(&queue))
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(SWEEP_BATCH)
                .query_async(&mut conn)
                .await?;
            for id in due {
                // only the instance that removed the entry dead-letters it
                let claimed: i64 = redis::cmd("ZREM")
                    .arg(self.delayed(&queue))
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                if claimed == 1 {
                    self.dead_letter(&queue, &id).await?;
                }
            }
        }
        Ok(())
    }

    /// Return in-flight messages of consumers whose heartbeat expired.
    async fn reclaim_dead_consumers(&self) -> Result<(), EventBusError> {
        let mut conn = self.redis.clone();
        let consumers: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.consumers())
            .query_async(&mut conn)
            .await?;

        for (tag, queue) in consumers {
            let alive: bool = redis::cmd("EXISTS")
                .arg(self.alive(&tag))
                .query_async(&mut conn)
                .await?;
            if alive {
                continue;
            }
            let removed: i64 = redis::cmd("HDEL")
                .arg(self.consumers())
                .arg(&tag)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }

            let mut reclaimed = 0usize;
            loop {
                let moved: Option<String> = redis::cmd("LMOVE")
                    .arg(self.inflight(&tag))
                    .arg(self.ready(&queue))
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query_async(&mut conn)
                    .await?;
                if moved.is_none() {
                    break;
                }
                reclaimed += 1;
            }
            warn!(consumer_tag = %tag, queue = %queue, reclaimed, "Reclaimed messages of dead consumer");
            self.delete_if_unused(&queue).await?;
        }
        Ok(())
    }
}

struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    retry_count: u32,
}

async fn run_sweeper(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    let mut consecutive_errors: u32 = 0;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let result = match store.sweep_expired().await {
                    Ok(()) => store.reclaim_dead_consumers().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors == 1 || consecutive_errors % 50 == 0 {
                            error!(error = %e, consecutive_errors, "Broker sweep failed");
                        }
                    }
                }
            }
        }
    }
    debug!("Broker sweeper stopped");
}

async fn run_heartbeat(store: Store, consumer_tag: String, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let mut conn = store.redis.clone();
                let beat = redis::cmd("SET")
                    .arg(store.alive(&consumer_tag))
                    .arg(1)
                    .arg("PX")
                    .arg(HEARTBEAT_TTL.as_millis() as u64)
                    .query_async::<()>(&mut conn)
                    .await;
                if let Err(e) = beat {
                    warn!(consumer_tag = %consumer_tag, error = %e, "Consumer heartbeat failed");
                }
            }
        }
    }
}

async fn run_consumer(
    store: Store,
    queue: String,
    consumer_tag: String,
    permits: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if *shutdown.borrow() {
            break;
        }

        match store.fetch(&queue, &consumer_tag).await {
            Ok(Some(delivery)) => {
                // returned by ack or reject
                permit.forget();
                if let Err(mpsc::error::SendError(delivery)) = sender.send(delivery) {
                    if let Err(e) = store.return_to_queue(&delivery).await {
                        warn!(queue = %queue, error = %e, "Failed to return undeliverable message");
                    }
                    break;
                }
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(e) => {
                drop(permit);
                warn!(queue = %queue, consumer_tag = %consumer_tag, error = %e, "Failed to fetch message");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!(queue = %queue, consumer_tag = %consumer_tag, "Redis consumer stopped");
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventBusError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        let mut conn = self.store.redis.clone();
        redis::cmd("SADD")
            .arg(self.store.exchanges())
            .arg(exchange)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), EventBusError> {
        if let Some(existing) = self.store.queue_options(queue).await? {
            if existing != options {
                return Err(EventBusError::PreconditionFailed(format!(
                    "queue '{queue}' exists with different arguments"
                )));
            }
            return Ok(());
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.store.meta(queue))
            .arg("durable")
            .arg(flag(options.durable))
            .arg("exclusive")
            .arg(flag(options.exclusive))
            .arg("auto_delete")
            .arg(flag(options.auto_delete));
        if let Some(target) = &options.dead_letter {
            cmd.arg("dlx").arg(&target.exchange);
            if let Some(routing_key) = &target.routing_key {
                cmd.arg("dlrk").arg(routing_key);
            }
        }
        let mut conn = self.store.redis.clone();
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EventBusError> {
        if self.store.queue_options(queue).await?.is_none() {
            return Err(EventBusError::queue_not_found(queue));
        }
        let mut conn = self.store.redis.clone();
        let declared: bool = redis::cmd("SISMEMBER")
            .arg(self.store.exchanges())
            .arg(exchange)
            .query_async(&mut conn)
            .await?;
        if !declared {
            return Err(EventBusError::exchange_not_found(exchange));
        }

        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.store.binding(exchange, routing_key))
            .arg(queue)
            .ignore()
            .cmd("SADD")
            .arg(self.store.queue_bindings(queue))
            .arg(format!("{exchange}{BINDING_SEPARATOR}{routing_key}"))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EventBusError> {
        let mut conn = self.store.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.store.binding(exchange, routing_key))
            .arg(queue)
            .ignore()
            .cmd("SREM")
            .arg(self.store.queue_bindings(queue))
            .arg(format!("{exchange}{BINDING_SEPARATOR}{routing_key}"))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: OutboundMessage,
    ) -> Result<(), EventBusError> {
        self.store.publish(exchange, message).await
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, EventBusError> {
        if self.store.queue_options(queue).await?.is_none() {
            return Err(EventBusError::queue_not_found(queue));
        }

        let tag = format!("ctag-{}", Uuid::new_v4());
        let mut conn = self.store.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.store.consumers())
            .arg(&tag)
            .arg(queue)
            .ignore()
            .cmd("SET")
            .arg(self.store.alive(&tag))
            .arg(1)
            .arg("PX")
            .arg(HEARTBEAT_TTL.as_millis() as u64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        let permits = Arc::new(Semaphore::new(prefetch.max(1)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (sender, deliveries) = mpsc::unbounded_channel();

        tokio::spawn(run_heartbeat(
            self.store.clone(),
            tag.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_consumer(
            self.store.clone(),
            queue.to_string(),
            tag.clone(),
            permits.clone(),
            sender,
            shutdown_rx,
        ));

        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tag.clone(), ConsumerHandle { permits, shutdown });

        debug!(queue, consumer_tag = %tag, prefetch, "Started Redis consumer");
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError> {
        let mut conn = self.store.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.store.inflight(&delivery.consumer_tag))
            .arg(1)
            .arg(&delivery.delivery_tag)
            .ignore()
            .cmd("DEL")
            .arg(self.store.message(&delivery.delivery_tag))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        self.release_permit(&delivery.consumer_tag);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError> {
        let mut conn = self.store.redis.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(self.store.inflight(&delivery.consumer_tag))
            .arg(1)
            .arg(&delivery.delivery_tag)
            .query_async(&mut conn)
            .await?;
        self.release_permit(&delivery.consumer_tag);
        if removed == 0 {
            return Ok(());
        }

        let queue_exists = self.store.queue_options(&delivery.queue).await?.is_some();
        if requeue && queue_exists {
            redis::cmd("LPUSH")
                .arg(self.store.ready(&delivery.queue))
                .arg(&delivery.delivery_tag)
                .query_async::<()>(&mut conn)
                .await?;
            return Ok(());
        }
        if queue_exists {
            self.store
                .dead_letter(&delivery.queue, &delivery.delivery_tag)
                .await
        } else {
            redis::cmd("DEL")
                .arg(self.store.message(&delivery.delivery_tag))
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), EventBusError> {
        let handle = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(consumer_tag);
        let Some(handle) = handle else {
            return Ok(());
        };
        let _ = handle.shutdown.send(true);

        let mut conn = self.store.redis.clone();
        let queue: Option<String> = redis::cmd("HGET")
            .arg(self.store.consumers())
            .arg(consumer_tag)
            .query_async(&mut conn)
            .await?;
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.store.consumers())
            .arg(consumer_tag)
            .ignore()
            .cmd("DEL")
            .arg(self.store.alive(consumer_tag))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        if let Some(queue) = queue {
            self.store.delete_if_unused(&queue).await?;
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), EventBusError> {
        self.store.delete_queue(queue).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, EventBusError> {
        if self.store.queue_options(queue).await?.is_none() {
            return Err(EventBusError::queue_not_found(queue));
        }
        let mut conn = self.store.redis.clone();
        let (ready, delayed): (u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(self.store.ready(queue))
            .cmd("ZCARD")
            .arg(self.store.delayed(queue))
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }
}
