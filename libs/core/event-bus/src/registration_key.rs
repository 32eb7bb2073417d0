//! Typed pub/sub keys and their wire representation.
//!
//! A key travels as the routing key `<typeTag>:<value>`. The tag runs up to the
//! first `:` and selects the factory that rebuilds the typed key from the
//! remaining value, which may itself contain `:`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EventBusError;

/// A pub/sub topic key.
///
/// Two keys are equal when they share the type tag and string value.
pub trait RegistrationKey: fmt::Debug + Send + Sync + 'static {
    /// Wire tag identifying the key kind
    fn key_type(&self) -> &str;

    fn as_string(&self) -> String;
}

impl PartialEq for dyn RegistrationKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_type() == other.key_type() && self.as_string() == other.as_string()
    }
}

impl Eq for dyn RegistrationKey {}

/// Routing key carried by a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// The key every group queue is bound with.
    pub fn unconditional() -> Self {
        Self(String::new())
    }

    pub fn of(key: &dyn RegistrationKey) -> Self {
        Self(format!("{}:{}", key.key_type(), key.as_string()))
    }

    pub fn is_unconditional(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuilds one kind of [`RegistrationKey`] from its string value.
pub trait RegistrationKeyFactory: Send + Sync + 'static {
    fn key_type(&self) -> &str;

    fn from_string(&self, value: &str) -> Result<Box<dyn RegistrationKey>, EventBusError>;
}

/// Factory backed by a closure.
pub struct FnKeyFactory<F> {
    key_type: String,
    parse: F,
}

impl<F> FnKeyFactory<F>
where
    F: Fn(&str) -> Result<Box<dyn RegistrationKey>, EventBusError> + Send + Sync + 'static,
{
    pub fn new(key_type: impl Into<String>, parse: F) -> Self {
        Self {
            key_type: key_type.into(),
            parse,
        }
    }
}

impl<F> RegistrationKeyFactory for FnKeyFactory<F>
where
    F: Fn(&str) -> Result<Box<dyn RegistrationKey>, EventBusError> + Send + Sync + 'static,
{
    fn key_type(&self) -> &str {
        &self.key_type
    }

    fn from_string(&self, value: &str) -> Result<Box<dyn RegistrationKey>, EventBusError> {
        (self.parse)(value)
    }
}

/// Converts between [`RegistrationKey`]s and routing key strings.
#[derive(Clone, Default)]
pub struct RoutingKeyConverter {
    factories: HashMap<String, Arc<dyn RegistrationKeyFactory>>,
}

impl RoutingKeyConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; at most one factory per tag.
    pub fn with_factory(
        mut self,
        factory: impl RegistrationKeyFactory,
    ) -> Result<Self, EventBusError> {
        let tag = factory.key_type().to_string();
        if tag.is_empty() || tag.contains(':') {
            return Err(EventBusError::InvalidArgument(format!(
                "invalid registration key type tag '{tag}'"
            )));
        }
        if self.factories.contains_key(&tag) {
            return Err(EventBusError::InvalidArgument(format!(
                "a factory is already registered for key type '{tag}'"
            )));
        }
        self.factories.insert(tag, Arc::new(factory));
        Ok(self)
    }

    pub fn to_routing_key(&self, key: &dyn RegistrationKey) -> RoutingKey {
        RoutingKey::of(key)
    }

    pub fn to_registration_key(
        &self,
        routing_key: &str,
    ) -> Result<Box<dyn RegistrationKey>, EventBusError> {
        if routing_key.is_empty() {
            return Err(EventBusError::InvalidArgument(
                "routing key must not be empty".to_string(),
            ));
        }
        let (tag, value) = routing_key.split_once(':').ok_or_else(|| {
            EventBusError::InvalidArgument(format!(
                "routing key '{routing_key}' has no type separator"
            ))
        })?;
        let factory = self.factories.get(tag).ok_or_else(|| {
            EventBusError::InvalidArgument(format!("unknown registration key type '{tag}'"))
        })?;
        factory.from_string(value).map_err(|e| match e {
            EventBusError::InvalidArgument(_) => e,
            other => EventBusError::InvalidArgument(other.to_string()),
        })
    }
}

impl fmt::Debug for RoutingKeyConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("RoutingKeyConverter")
            .field("key_types", &tags)
            .finish()
    }
}
