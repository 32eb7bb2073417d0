//! Event Bus
//!
//! A distributed event bus over an AMQP-like broker, combining two delivery
//! models on one namespace exchange.
//!
//! ## Features
//!
//! - **Groups**: durable competing-consumer queues, one per [`Group`], shared
//!   by every instance registering it
//! - **Retries**: failed group deliveries are retried with jittered
//!   exponential backoff through a per-group retry exchange
//! - **Dead letters**: events exhausting their retries, or failing to
//!   dispatch, are stored in [`EventDeadLetters`] until redelivered
//! - **Keys**: ephemeral pub/sub to listeners of this instance registered on a
//!   [`RegistrationKey`]
//! - **Backends**: [`InMemoryBroker`] for single-process use and tests,
//!   [`RedisBroker`] for multi-instance deployments
//! - **Health endpoints** and **Prometheus metrics**
//!
//! ```text
//!                      dispatch(event, keys)
//!                               │
//!                               ▼
//!                        {ns}-exchange
//!             ""  ┌─────────────┴──────────────┐  "{tag}:{value}"
//!                 ▼                            ▼
//!       {ns}-workQueue-{group}        {ns}-eventbus-{id}
//!        (durable, shared)          (exclusive, per instance)
//!                 │                            │
//!          group listener                key listeners
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use event_bus::{EventBus, EventBusConfig, Group, InMemoryBroker, JsonEventSerializer,
//!     MemoryEventDeadLetters, RoutingKeyConverter};
//!
//! let bus = EventBus::new(
//!     EventBusConfig::from_env()?,
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(JsonEventSerializer::<MailboxEvent>::new()),
//!     RoutingKeyConverter::new().with_factory(MailboxKeyFactory)?,
//!     Arc::new(MemoryEventDeadLetters::new()),
//! );
//! bus.register_group(Arc::new(Indexer::new()), Group::new("indexer")).await?;
//! bus.start().await?;
//! bus.dispatch(&event, &[&MailboxKey::new(mailbox_id)]).await?;
//! ```

mod backoff;
mod broker;
mod config;
mod dead_letters;
mod error;
mod event;
mod event_bus;
mod group;
mod health;
mod key;
mod listener;
pub mod metrics;
mod naming;
mod registration_key;
mod serializer;

pub use backoff::WaitDelayGenerator;
pub use broker::{
    Broker, ChannelPool, Consumer, DEFAULT_EXCHANGE, DeadLetterTarget, Delivery, InMemoryBroker,
    OutboundMessage, QueueOptions, RedisBroker,
};
pub use config::{EventBusConfig, PoolConfig, RetryBackoffConfiguration};
pub use dead_letters::{
    EventDeadLetters, InsertionId, MemoryEventDeadLetters, RedisEventDeadLetters,
};
pub use error::{ErrorCategory, EventBusError, ListenerError};
pub use event::{Event, EventId};
pub use event_bus::{EventBus, RedeliveryReport};
pub use group::{DeliveryState, Group, GroupRegistrationHandler};
pub use health::{
    ComponentHealth, EventBusDeadLettersQueueHealthCheck, EventDeadLettersHealthCheck,
    HealthCheck, HealthState, HealthStatus, ReadinessReport, health_router,
};
pub use key::{KeyRegistrationHandler, Registration};
pub use listener::{EventListener, ExecutionMode};
pub use metrics::{EventBusMetrics, init_metrics, render_metrics};
pub use naming::{EventBusId, EventBusName, NamingStrategy};
pub use registration_key::{
    FnKeyFactory, RegistrationKey, RegistrationKeyFactory, RoutingKey, RoutingKeyConverter,
};
pub use serializer::{EventSerializer, JsonEventSerializer};
