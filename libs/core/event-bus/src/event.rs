//! Events carried by the bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn random() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An immutable domain event.
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct MailboxAdded { event_id: EventId, mailbox: String }
///
/// impl Event for MailboxAdded {
///     fn event_id(&self) -> EventId { self.event_id }
/// }
/// ```
pub trait Event: fmt::Debug + Clone + Send + Sync + 'static {
    fn event_id(&self) -> EventId;

    /// Noop events are neither dispatched nor delivered.
    fn is_noop(&self) -> bool {
        false
    }
}
