//! Broker naming for one namespace.
//!
//! | Entity | Name |
//! |---|---|
//! | exchange | `{ns}-exchange` |
//! | group work queue | `{ns}-workQueue-{group}` |
//! | group retry exchange | `{ns}-retryExchange-{group}` |
//! | group retry queue | `{ns}-retryQueue-{group}` |
//! | dead-letter exchange | `{ns}-dead-letter-exchange` |
//! | dead-letter queue | `{ns}-dead-letter-queue` |
//! | key queue of an instance | `{ns}-eventbus-{eventBusId}` |
//!
//! Namespaces never contain `-`, so the namespace is always the text before the
//! first dash and two namespaces can not produce the same name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::group::Group;

/// Namespace of an event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventBusName(String);

impl EventBusName {
    pub const DEFAULT: &'static str = "events";

    /// Create a namespace. Only ASCII letters, digits and `_` are accepted.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if name.is_empty() {
            return Err(EventBusError::InvalidArgument(
                "event bus name must not be empty".to_string(),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EventBusError::InvalidArgument(format!(
                "event bus name '{name}' may only contain letters, digits and '_'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventBusName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for EventBusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventBusName {
    type Error = EventBusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventBusName> for String {
    fn from(value: EventBusName) -> Self {
        value.0
    }
}

/// Identity of one running event bus instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventBusId(Uuid);

impl EventBusId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for EventBusId {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| EventBusError::InvalidArgument(format!("invalid event bus id '{s}': {e}")))
    }
}

impl fmt::Display for EventBusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Maps a namespace and its groups and instances to broker names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingStrategy {
    name: EventBusName,
}

impl NamingStrategy {
    pub fn new(name: EventBusName) -> Self {
        Self { name }
    }

    pub fn event_bus_name(&self) -> &EventBusName {
        &self.name
    }

    pub fn exchange(&self) -> String {
        format!("{}-exchange", self.name)
    }

    pub fn work_queue(&self, group: &Group) -> String {
        format!("{}-workQueue-{}", self.name, group.as_str())
    }

    pub fn retry_exchange(&self, group: &Group) -> String {
        format!("{}-retryExchange-{}", self.name, group.as_str())
    }

    pub fn retry_queue(&self, group: &Group) -> String {
        format!("{}-retryQueue-{}", self.name, group.as_str())
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}-dead-letter-exchange", self.name)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dead-letter-queue", self.name)
    }

    pub fn key_queue(&self, event_bus_id: &EventBusId) -> String {
        format!("{}-eventbus-{}", self.name, event_bus_id)
    }

    /// Reject groups whose derived names would collide with reserved ones.
    pub fn validate_group(&self, group: &Group) -> Result<(), EventBusError> {
        if group.as_str().is_empty() {
            return Err(EventBusError::NamingCollision(
                "group name must not be empty".to_string(),
            ));
        }
        if group.is_dispatching_failure() {
            return Err(EventBusError::NamingCollision(format!(
                "group '{group}' is reserved for dispatch failures"
            )));
        }
        Ok(())
    }
}
