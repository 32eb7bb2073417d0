//! Application-level dead letters.
//!
//! Events that exhausted their group retries, or that could not be dispatched
//! at all, are kept here until explicitly redelivered or removed.

mod memory;
mod redis;

pub use memory::MemoryEventDeadLetters;
pub use self::redis::RedisEventDeadLetters;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::event::Event;
use crate::group::Group;

/// Identifier assigned to an event when it is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsertionId(Uuid);

impl InsertionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InsertionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InsertionId {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EventBusError::InvalidArgument(format!("invalid insertion id '{s}': {e}")))
    }
}

/// Store of failed events keyed by group and insertion id.
///
/// Implementations must be safe under concurrent use across groups.
#[async_trait]
pub trait EventDeadLetters<E: Event>: Send + Sync + 'static {
    /// Store an event, returning its fresh insertion id.
    async fn store(&self, group: &Group, event: &E) -> Result<InsertionId, EventBusError>;

    /// Remove one entry. Removing an unknown entry is a no-op.
    async fn remove(&self, group: &Group, id: InsertionId) -> Result<(), EventBusError>;

    /// Remove every entry of a group.
    async fn remove_group(&self, group: &Group) -> Result<(), EventBusError>;

    async fn failed_event(&self, group: &Group, id: InsertionId)
    -> Result<Option<E>, EventBusError>;

    /// Insertion ids of a group, oldest first.
    async fn failed_ids(&self, group: &Group) -> Result<Vec<InsertionId>, EventBusError>;

    async fn groups_with_failed_events(&self) -> Result<Vec<Group>, EventBusError>;

    async fn contain_events(&self) -> Result<bool, EventBusError>;
}
