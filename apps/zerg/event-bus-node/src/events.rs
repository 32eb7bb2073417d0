//! Events carried by the node and the listeners it runs.

use async_trait::async_trait;
use event_bus::{
    Event, EventBusError, EventId, EventListener, FnKeyFactory, ListenerError, RegistrationKey,
    RoutingKeyConverter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// An application event with an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event_id: EventId,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl NodeEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: EventId::random(),
            kind: kind.into(),
            payload,
        }
    }
}

impl Event for NodeEvent {
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn is_noop(&self) -> bool {
        self.kind.is_empty()
    }
}

/// Routes events to the listeners of one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantKey(pub String);

impl TenantKey {
    pub const KEY_TYPE: &'static str = "tenant";
}

impl RegistrationKey for TenantKey {
    fn key_type(&self) -> &str {
        Self::KEY_TYPE
    }

    fn as_string(&self) -> String {
        self.0.clone()
    }
}

/// Converter knowing every key type the node dispatches with.
pub fn routing_key_converter() -> Result<RoutingKeyConverter, EventBusError> {
    RoutingKeyConverter::new().with_factory(FnKeyFactory::new(
        TenantKey::KEY_TYPE,
        |value: &str| Ok(Box::new(TenantKey(value.to_string())) as Box<dyn RegistrationKey>),
    ))
}

/// Group listener writing every event to the audit log.
#[derive(Debug, Default)]
pub struct AuditListener {
    audited: AtomicU64,
}

impl AuditListener {
    pub fn audited(&self) -> u64 {
        self.audited.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventListener<NodeEvent> for AuditListener {
    async fn event(&self, event: &NodeEvent) -> Result<(), ListenerError> {
        self.audited.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "audit",
            event_id = %event.event_id,
            kind = %event.kind,
            payload = %event.payload,
            "Event audited"
        );
        Ok(())
    }
}
