use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Broker, Consumer, DEFAULT_EXCHANGE, Delivery, OutboundMessage, QueueOptions};
use crate::error::EventBusError;

/// Single-process broker.
///
/// Message expiration runs on the tokio clock, so tests with a paused clock
/// drive retries deterministically. [`InMemoryBroker::pause`] makes every
/// operation fail as if the broker were unreachable.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    /// exchange -> (routing key, queue)
    bindings: HashMap<String, BTreeSet<(String, String)>>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<String, Unacked>,
    paused: bool,
    next_id: u64,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    consumers: Vec<String>,
    cursor: usize,
}

struct Message {
    id: u64,
    routing_key: String,
    payload: Vec<u8>,
    retry_count: u32,
    expiration: Option<Duration>,
}

struct ConsumerState {
    queue: String,
    prefetch: usize,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Message,
}

/// Expiry timer to arm once the lock is released
struct Expiry {
    queue: String,
    message_id: u64,
    ttl: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable broker.
    pub fn pause(&self) {
        self.lock().paused = true;
        debug!("In-memory broker paused");
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        state.paused = false;
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            state.pump(&queue);
        }
        debug!("In-memory broker resumed");
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Routing keys binding `queue` to `exchange`
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .get(exchange)
            .map(|set| {
                set.iter()
                    .filter(|(_, q)| q == queue)
                    .map(|(rk, _)| rk.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the state, failing while paused.
    fn reachable(&self) -> Result<MutexGuard<'_, State>, EventBusError> {
        let state = self.lock();
        if state.paused {
            return Err(EventBusError::transient("broker unreachable"));
        }
        Ok(state)
    }

    fn arm(&self, expiries: Vec<Expiry>) {
        for expiry in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expiry.ttl).await;
                let mut state = broker.lock();
                let expired = state.expire(&expiry.queue, expiry.message_id);
                drop(state);
                broker.arm(expired);
            });
        }
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, EventBusError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }
        if !self.exchanges.contains(exchange) {
            return Err(EventBusError::exchange_not_found(exchange));
        }
        let queues: BTreeSet<String> = self
            .bindings
            .get(exchange)
            .map(|set| {
                set.iter()
                    .filter(|(rk, _)| rk == routing_key)
                    .map(|(_, q)| q.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(queues.into_iter().collect())
    }

    fn publish(
        &mut self,
        exchange: &str,
        message: OutboundMessage,
    ) -> Result<Vec<Expiry>, EventBusError> {
        let mut expiries = Vec::new();
        let targets = self.route(exchange, &message.routing_key)?;
        if targets.is_empty() {
            trace!(exchange, routing_key = %message.routing_key, "Dropped unroutable message");
        }
        for queue in targets {
            let stored = Message {
                id: self.next_id(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                retry_count: message.retry_count,
                expiration: message.expiration,
            };
            expiries.extend(self.enqueue(&queue, stored));
        }
        Ok(expiries)
    }

    fn enqueue(&mut self, queue: &str, message: Message) -> Option<Expiry> {
        let state = self.queues.get_mut(queue)?;
        let expiry = message.expiration.map(|ttl| Expiry {
            queue: queue.to_string(),
            message_id: message.id,
            ttl,
        });
        state.ready.push_back(message);
        self.pump(queue);
        expiry
    }

    /// Remove an expired message still waiting in `queue` and dead-letter it.
    fn expire(&mut self, queue: &str, message_id: u64) -> Vec<Expiry> {
        let Some(state) = self.queues.get_mut(queue) else {
            return Vec::new();
        };
        let Some(position) = state.ready.iter().position(|m| m.id == message_id) else {
            return Vec::new();
        };
        match state.ready.remove(position) {
            Some(message) => self.dead_letter(queue, message),
            None => Vec::new(),
        }
    }

    fn dead_letter(&mut self, queue: &str, message: Message) -> Vec<Expiry> {
        let Some(target) = self
            .queues
            .get(queue)
            .and_then(|state| state.options.dead_letter.clone())
        else {
            trace!(queue, "Dropped dead letter without target");
            return Vec::new();
        };
        let outbound = OutboundMessage {
            routing_key: target.routing_key.unwrap_or(message.routing_key),
            payload: message.payload,
            retry_count: message.retry_count,
            expiration: None,
        };
        self.publish(&target.exchange, outbound).unwrap_or_default()
    }

    /// Hand ready messages to consumers with spare prefetch, round robin.
    fn pump(&mut self, queue: &str) {
        if self.paused {
            return;
        }
        let State {
            queues,
            consumers,
            unacked,
            next_id,
            ..
        } = self;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() && !state.consumers.is_empty() {
            let count = state.consumers.len();
            let chosen = (0..count)
                .map(|offset| (state.cursor + offset) % count)
                .find(|&index| {
                    consumers
                        .get(&state.consumers[index])
                        .is_some_and(|c| c.in_flight < c.prefetch)
                });
            let Some(index) = chosen else {
                break;
            };
            state.cursor = (index + 1) % count;

            let tag = state.consumers[index].clone();
            let Some(consumer) = consumers.get_mut(&tag) else {
                break;
            };
            let Some(message) = state.ready.pop_front() else {
                break;
            };

            *next_id += 1;
            let delivery = Delivery {
                delivery_tag: format!("dtag-{next_id}"),
                consumer_tag: tag.clone(),
                queue: queue.to_string(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                retry_count: message.retry_count,
            };

            if consumer.sender.send(delivery.clone()).is_err() {
                // receiver dropped without cancel
                state.ready.push_front(message);
                state.consumers.retain(|c| c != &tag);
                consumers.remove(&tag);
                continue;
            }
            consumer.in_flight += 1;
            unacked.insert(
                delivery.delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag: tag,
                    message,
                },
            );
        }
    }

    /// Release the prefetch slot held by a delivery.
    fn settle(&mut self, delivery_tag: &str) -> Option<Unacked> {
        let entry = self.unacked.remove(delivery_tag)?;
        if let Some(consumer) = self.consumers.get_mut(&entry.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(entry)
    }

    fn remove_queue(&mut self, queue: &str) {
        let Some(state) = self.queues.remove(queue) else {
            return;
        };
        for tag in state.consumers {
            self.consumers.remove(&tag);
        }
        for set in self.bindings.values_mut() {
            set.retain(|(_, q)| q != queue);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        if exchange != DEFAULT_EXCHANGE {
            state.exchanges.insert(exchange.to_string());
        }
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        if let Some(existing) = state.queues.get(queue) {
            if existing.options != options {
                return Err(EventBusError::PreconditionFailed(format!(
                    "queue '{queue}' exists with different arguments"
                )));
            }
            return Ok(());
        }
        state.queues.insert(
            queue.to_string(),
            QueueState {
                options,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        if !state.queues.contains_key(queue) {
            return Err(EventBusError::queue_not_found(queue));
        }
        if !state.exchanges.contains(exchange) {
            return Err(EventBusError::exchange_not_found(exchange));
        }
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert((routing_key.to_string(), queue.to_string()));
        Ok(())
    }

    async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        if let Some(set) = state.bindings.get_mut(exchange) {
            set.remove(&(routing_key.to_string(), queue.to_string()));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: OutboundMessage,
    ) -> Result<(), EventBusError> {
        let expiries = self.reachable()?.publish(exchange, message)?;
        self.arm(expiries);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, EventBusError> {
        let mut state = self.reachable()?;
        if !state.queues.contains_key(queue) {
            return Err(EventBusError::queue_not_found(queue));
        }
        let tag = format!("ctag-{}", state.next_id());
        let (sender, deliveries) = mpsc::unbounded_channel();
        state.consumers.insert(
            tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                prefetch: prefetch.max(1),
                in_flight: 0,
                sender,
            },
        );
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.consumers.push(tag.clone());
        }
        state.pump(queue);
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        if let Some(entry) = state.settle(&delivery.delivery_tag) {
            state.pump(&entry.queue);
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError> {
        let mut state = self.reachable()?;
        let Some(entry) = state.settle(&delivery.delivery_tag) else {
            return Ok(());
        };
        let expiries = if requeue {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                queue.ready.push_front(entry.message);
            }
            Vec::new()
        } else {
            state.dead_letter(&entry.queue, entry.message)
        };
        state.pump(&entry.queue);
        drop(state);
        self.arm(expiries);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), EventBusError> {
        let mut state = self.lock();
        let Some(consumer) = state.consumers.remove(consumer_tag) else {
            return Ok(());
        };
        let auto_delete = match state.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.consumers.retain(|c| c != consumer_tag);
                queue.cursor = 0;
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if auto_delete {
            state.remove_queue(&consumer.queue);
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), EventBusError> {
        self.reachable()?.remove_queue(queue);
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, EventBusError> {
        let state = self.reachable()?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| EventBusError::queue_not_found(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeadLetterTarget;

    async fn setup() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("ex").await.unwrap();
        broker
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        broker.bind("work", "ex", "").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_routes_by_binding_and_default_exchange() {
        let broker = setup().await;
        broker
            .publish("ex", OutboundMessage::new("", b"a".to_vec()))
            .await
            .unwrap();
        broker
            .publish("ex", OutboundMessage::new("other", b"b".to_vec()))
            .await
            .unwrap();
        broker
            .publish("", OutboundMessage::new("work", b"c".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("work").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = setup().await;
        let err = broker
            .publish("nope", OutboundMessage::new("", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_options_fails() {
        let broker = setup().await;
        broker
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        let err = broker
            .declare_queue(
                "work",
                QueueOptions::durable().with_dead_letter("dlx", None),
            )
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_prefetch_and_ack() {
        let broker = setup().await;
        for payload in [b"1", b"2"] {
            broker
                .publish("ex", OutboundMessage::new("", payload.to_vec()))
                .await
                .unwrap();
        }
        let mut consumer = broker.consume("work", 1).await.unwrap();
        let first = consumer.deliveries.recv().await.unwrap();
        assert_eq!(first.payload, b"1");
        assert!(consumer.deliveries.try_recv().is_err());

        broker.ack(&first).await.unwrap();
        let second = consumer.deliveries.recv().await.unwrap();
        assert_eq!(second.payload, b"2");
    }

    #[tokio::test]
    async fn test_reject_requeues_at_head() {
        let broker = setup().await;
        broker
            .publish("ex", OutboundMessage::new("", b"x".to_vec()))
            .await
            .unwrap();
        let mut consumer = broker.consume("work", 1).await.unwrap();
        let delivery = consumer.deliveries.recv().await.unwrap();
        broker.reject(&delivery, true).await.unwrap();
        let again = consumer.deliveries.recv().await.unwrap();
        assert_eq!(again.payload, b"x");
        assert_ne!(again.delivery_tag, delivery.delivery_tag);
    }

    #[tokio::test]
    async fn test_reject_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.unwrap();
        broker
            .declare_queue("dlq", QueueOptions::durable())
            .await
            .unwrap();
        broker.bind("dlq", "dlx", "").await.unwrap();
        broker
            .declare_queue(
                "work",
                QueueOptions::durable().with_dead_letter("dlx", Some(String::new())),
            )
            .await
            .unwrap();
        broker
            .publish("", OutboundMessage::new("work", b"bad".to_vec()))
            .await
            .unwrap();

        let mut consumer = broker.consume("work", 1).await.unwrap();
        let delivery = consumer.deliveries.recv().await.unwrap();
        broker.reject(&delivery, false).await.unwrap();

        assert_eq!(broker.queue_depth("work").await.unwrap(), 0);
        assert_eq!(broker.queue_depth("dlq").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered_to_target_queue() {
        let broker = setup().await;
        broker.declare_exchange("retry").await.unwrap();
        broker
            .declare_queue(
                "retry-q",
                QueueOptions {
                    durable: true,
                    dead_letter: Some(DeadLetterTarget {
                        exchange: DEFAULT_EXCHANGE.to_string(),
                        routing_key: Some("work".to_string()),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        broker.bind("retry-q", "retry", "").await.unwrap();

        broker
            .publish(
                "retry",
                OutboundMessage::new("", b"later".to_vec())
                    .with_retry_count(2)
                    .with_expiration(Duration::from_millis(500)),
            )
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("retry-q").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(broker.queue_depth("work").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.queue_depth("retry-q").await.unwrap(), 0);

        let mut consumer = broker.consume("work", 1).await.unwrap();
        let delivery = consumer.deliveries.recv().await.unwrap();
        assert_eq!(delivery.payload, b"later");
        assert_eq!(delivery.retry_count, 2);
        assert_eq!(delivery.routing_key, "work");
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = setup().await;
        let mut a = broker.consume("work", 10).await.unwrap();
        let mut b = broker.consume("work", 10).await.unwrap();
        for i in 0..4u8 {
            broker
                .publish("ex", OutboundMessage::new("", vec![i]))
                .await
                .unwrap();
        }
        let mut a_count = 0;
        while a.deliveries.try_recv().is_ok() {
            a_count += 1;
        }
        let mut b_count = 0;
        while b.deliveries.try_recv().is_ok() {
            b_count += 1;
        }
        assert_eq!((a_count, b_count), (2, 2));
    }

    #[tokio::test]
    async fn test_cancel_closes_channel_and_auto_deletes() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue("mine", QueueOptions::ephemeral())
            .await
            .unwrap();
        let mut consumer = broker.consume("mine", 1).await.unwrap();
        broker.cancel(&consumer.tag).await.unwrap();
        assert!(consumer.deliveries.recv().await.is_none());
        assert!(!broker.queue_exists("mine"));
    }

    #[tokio::test]
    async fn test_paused_broker_is_unreachable() {
        let broker = setup().await;
        broker.pause();
        let err = broker
            .publish("ex", OutboundMessage::new("", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        broker.resume();
        broker
            .publish("ex", OutboundMessage::new("", vec![]))
            .await
            .unwrap();
    }
}
