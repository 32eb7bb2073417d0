//! Error types for the event bus.
//!
//! Errors are categorized the same way delivery failures are handled:
//! - **Transient**: broker unreachable or pool exhausted, the caller may retry
//!   and dispatch failures are recorded for later redelivery
//! - **Permanent**: malformed payloads, bad arguments, registration mistakes

use std::fmt;
use thiserror::Error;

use crate::group::Group;

/// Category of error for determining recovery behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (disconnect, pool timeout)
    Transient,
    /// Unrecoverable failure, retrying cannot succeed
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Event bus errors
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Broker unreachable, channel pool timeout or command failure
    #[error("transient broker error: {message}")]
    TransientBroker {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload or routing key that can never be parsed
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Caller supplied an invalid value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// reDeliver targeted a group without a local registration
    #[error("no registration found for group {0}")]
    GroupRegistrationNotFound(Group),

    /// A different listener already owns this group locally
    #[error("group {0} is already registered with another listener")]
    GroupAlreadyRegistered(Group),

    /// Two logical entities would map to the same broker name
    #[error("naming collision: {0}")]
    NamingCollision(String),

    /// Queue re-declared with arguments different from the existing queue
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Queue or exchange does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl EventBusError {
    /// Create a transient broker error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientBroker {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient broker error with a source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientBroker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn queue_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "queue",
            name: name.into(),
        }
    }

    pub fn exchange_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "exchange",
            name: name.into(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EventBusError::TransientBroker { .. } => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Check if this error is a transient broker failure.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, EventBusError::PreconditionFailed(_))
    }
}

impl From<redis::RedisError> for EventBusError {
    fn from(err: redis::RedisError) -> Self {
        EventBusError::transient_with_source("redis command failed", err)
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        EventBusError::MalformedMessage(err.to_string())
    }
}

/// Failure reported by an event listener.
///
/// Group listeners are retried with backoff on this error; key listeners only
/// log it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<EventBusError> for ListenerError {
    fn from(err: EventBusError) -> Self {
        ListenerError::with_source("event bus operation failed", err)
    }
}
