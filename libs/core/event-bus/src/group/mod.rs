//! Durable competing-consumer groups.
//!
//! Every instance registering the same [`Group`] consumes the same work queue,
//! so each event reaches exactly one instance per group. Failures are retried
//! through a per-group retry exchange whose queue dead-letters expired
//! messages back into the work queue:
//!
//! ```text
//!   exchange ──""──▶ workQueue-{group} ──▶ listener
//!                        ▲                    │ failure
//!                        │ TTL expiry         ▼
//!                   retryQueue-{group} ◀── retryExchange-{group}
//! ```
//!
//! Once retries are exhausted the event is stored in the application dead
//! letters under its group.

mod handler;
mod registration;
mod retry;

pub use handler::GroupRegistrationHandler;
pub use retry::DeliveryState;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::backoff::WaitDelayGenerator;
use crate::broker::ChannelPool;
use crate::dead_letters::EventDeadLetters;
use crate::event::Event;
use crate::naming::NamingStrategy;
use crate::serializer::EventSerializer;

/// Name of a durable listener group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(String);

impl Group {
    const DISPATCHING_FAILURE: &'static str = "dispatching-failure";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Reserved group holding events whose dispatch failed.
    pub fn dispatching_failure() -> Self {
        Self(Self::DISPATCHING_FAILURE.to_string())
    }

    pub fn is_dispatching_failure(&self) -> bool {
        self.0 == Self::DISPATCHING_FAILURE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Group {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Collaborators shared by every group registration of a bus.
pub(crate) struct GroupContext<E: Event> {
    pub pool: ChannelPool,
    pub naming: NamingStrategy,
    pub serializer: Arc<dyn EventSerializer<E>>,
    pub dead_letters: Arc<dyn EventDeadLetters<E>>,
    pub delays: WaitDelayGenerator,
    pub max_concurrent_deliveries: usize,
}
