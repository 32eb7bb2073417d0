//! Message broker abstraction.
//!
//! The bus relies on a small AMQP-like model:
//!
//! ```text
//!   publish(exchange, routing key)
//!        │
//!        ▼
//!   ┌──────────┐  binding(routing key)  ┌───────┐  consume  ┌──────────┐
//!   │ exchange │ ─────────────────────▶ │ queue │ ────────▶ │ consumer │
//!   └──────────┘                        └───────┘           └──────────┘
//!                                           │ reject / TTL expiry
//!                                           ▼
//!                                  dead-letter exchange
//! ```
//!
//! - exchanges route on exact routing key match
//! - the default exchange `""` routes to the queue named by the routing key
//! - unroutable messages are dropped
//! - a message whose expiration lapses, or that is rejected without requeue,
//!   is republished to the queue's dead-letter target
//! - cancelling a consumer stops deliveries; outstanding deliveries can still
//!   be acknowledged

mod memory;
mod pool;
mod redis;

pub use memory::InMemoryBroker;
pub use pool::ChannelPool;
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::EventBusError;

/// Exchange routing by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// Where rejected or expired messages of a queue go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    /// Overrides the message routing key when set
    pub routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueOptions {
    /// Survives broker restarts and consumer churn
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Private to one instance, removed with its last consumer
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.into(),
            routing_key,
        });
        self
    }
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Number of redeliveries already attempted
    pub retry_count: u32,
    /// Per-message TTL after which the message is dead-lettered
    pub expiration: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            retry_count: 0,
            expiration: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// A message handed to a consumer, to be acknowledged or rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: String,
    pub consumer_tag: String,
    pub queue: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub retry_count: u32,
}

/// An active subscription; the channel closes when the consumer is cancelled.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventBusError>;

    /// Create the queue, or check an existing one has the same options.
    ///
    /// Fails with [`EventBusError::PreconditionFailed`] on mismatch.
    async fn declare_queue(&self, queue: &str, options: QueueOptions)
    -> Result<(), EventBusError>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), EventBusError>;

    async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), EventBusError>;

    async fn publish(&self, exchange: &str, message: OutboundMessage)
    -> Result<(), EventBusError>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, EventBusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventBusError>;

    /// Requeue at the head of the queue, or dead-letter when `requeue` is false.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), EventBusError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), EventBusError>;

    /// Delete a queue with its bindings; deleting a missing queue succeeds.
    async fn delete_queue(&self, queue: &str) -> Result<(), EventBusError>;

    /// Messages ready for delivery
    async fn queue_depth(&self, queue: &str) -> Result<u64, EventBusError>;
}
