//! Prometheus metrics for the event bus

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{error, info};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let installed = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });
    if let Err(e) = installed {
        error!(error = %e, "Failed to install Prometheus recorder");
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Event bus metrics helper, labelled by namespace and scope.
///
/// The scope is the group name for group deliveries, `keys` for key
/// deliveries and `dispatch` for the publishing side.
#[derive(Debug, Clone)]
pub struct EventBusMetrics {
    namespace: String,
    scope: String,
}

impl EventBusMetrics {
    pub fn new(namespace: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            scope: scope.into(),
        }
    }

    pub fn event_dispatched(&self, routing_keys: usize) {
        counter!(
            "event_bus_events_dispatched_total",
            "namespace" => self.namespace.clone()
        )
        .increment(1);

        counter!(
            "event_bus_messages_published_total",
            "namespace" => self.namespace.clone()
        )
        .increment(routing_keys as u64);
    }

    pub fn dispatch_failed(&self) {
        counter!(
            "event_bus_dispatch_failures_total",
            "namespace" => self.namespace.clone()
        )
        .increment(1);
    }

    pub fn listener_succeeded(&self, duration: Duration) {
        counter!(
            "event_bus_listener_invocations_total",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "event_bus_listener_duration_seconds",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn listener_failed(&self) {
        counter!(
            "event_bus_listener_invocations_total",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone(),
            "status" => "failed"
        )
        .increment(1);
    }

    pub fn retry_scheduled(&self) {
        counter!(
            "event_bus_retries_total",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "event_bus_dead_lettered_total",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone()
        )
        .increment(1);
    }

    pub fn malformed_dropped(&self) {
        counter!(
            "event_bus_malformed_dropped_total",
            "namespace" => self.namespace.clone(),
            "scope" => self.scope.clone()
        )
        .increment(1);
    }

    pub fn key_delivered(&self, listeners: usize) {
        counter!(
            "event_bus_key_deliveries_total",
            "namespace" => self.namespace.clone()
        )
        .increment(1);

        counter!(
            "event_bus_key_listener_fanout_total",
            "namespace" => self.namespace.clone()
        )
        .increment(listeners as u64);
    }
}
