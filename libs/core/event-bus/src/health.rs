//! Health checks and their HTTP endpoints.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes running every registered check (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::Broker;
use crate::dead_letters::EventDeadLetters;
use crate::event::Event;
use crate::metrics;
use crate::naming::NamingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    fn component_name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

/// Watches the broker dead-letter queue of a namespace.
///
/// Empty is healthy, messages present is degraded, an unreachable broker or
/// a missing queue is unhealthy.
pub struct EventBusDeadLettersQueueHealthCheck {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl EventBusDeadLettersQueueHealthCheck {
    pub const COMPONENT_NAME: &'static str = "EventbusDeadLettersQueue";

    pub fn new(broker: Arc<dyn Broker>, naming: &NamingStrategy) -> Self {
        Self {
            broker,
            queue: naming.dead_letter_queue(),
        }
    }
}

#[async_trait]
impl HealthCheck for EventBusDeadLettersQueueHealthCheck {
    fn component_name(&self) -> &str {
        Self::COMPONENT_NAME
    }

    async fn check(&self) -> ComponentHealth {
        match self.broker.queue_depth(&self.queue).await {
            Ok(0) => ComponentHealth::healthy(Self::COMPONENT_NAME),
            Ok(depth) => ComponentHealth::degraded(
                Self::COMPONENT_NAME,
                format!("{depth} undeliverable message(s) in '{}'", self.queue),
            ),
            Err(e) => ComponentHealth::unhealthy(
                Self::COMPONENT_NAME,
                format!("failed to inspect '{}': {e}", self.queue),
            ),
        }
    }
}

/// Degraded while the application dead letters hold events.
pub struct EventDeadLettersHealthCheck<E: Event> {
    dead_letters: Arc<dyn EventDeadLetters<E>>,
}

impl<E: Event> EventDeadLettersHealthCheck<E> {
    pub const COMPONENT_NAME: &'static str = "EventDeadLettersHealthCheck";

    pub fn new(dead_letters: Arc<dyn EventDeadLetters<E>>) -> Self {
        Self { dead_letters }
    }
}

#[async_trait]
impl<E: Event> HealthCheck for EventDeadLettersHealthCheck<E> {
    fn component_name(&self) -> &str {
        Self::COMPONENT_NAME
    }

    async fn check(&self) -> ComponentHealth {
        match self.dead_letters.contain_events().await {
            Ok(false) => ComponentHealth::healthy(Self::COMPONENT_NAME),
            Ok(true) => ComponentHealth::degraded(
                Self::COMPONENT_NAME,
                "EventDeadLetters contain events. This might indicate transient failure on event processing.",
            ),
            Err(e) => ComponentHealth::unhealthy(Self::COMPONENT_NAME, e.to_string()),
        }
    }
}

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    checks: Arc<Vec<Arc<dyn HealthCheck>>>,
}

impl HealthState {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            checks: Arc::new(Vec::new()),
        }
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        Arc::make_mut(&mut self.checks).push(check);
        self
    }

    /// Run every check; the overall status is the worst component status.
    pub async fn run_checks(&self) -> ReadinessReport {
        let components = join_all(self.checks.iter().map(|check| check.check())).await;
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        ReadinessReport { status, components }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Liveness probe handler. Always OK while the server responds.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Degraded components still report ready; any unhealthy one does not.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<ReadinessReport>) {
    let report = state.run_checks().await;
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with `/health`, `/healthz`, `/ready`, `/readyz` and `/metrics`.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, OutboundMessage, QueueOptions};
    use crate::dead_letters::MemoryEventDeadLetters;
    use crate::event::EventId;
    use crate::group::Group;
    use crate::naming::EventBusName;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[derive(Debug, Clone)]
    struct Ping(EventId);

    impl Event for Ping {
        fn event_id(&self) -> EventId {
            self.0
        }
    }

    fn naming() -> NamingStrategy {
        NamingStrategy::new(EventBusName::default())
    }

    #[tokio::test]
    async fn test_dead_letter_queue_check() {
        let broker = Arc::new(InMemoryBroker::new());
        let check = EventBusDeadLettersQueueHealthCheck::new(broker.clone(), &naming());

        // queue not declared yet
        assert_eq!(check.check().await.status, HealthStatus::Unhealthy);

        let queue = naming().dead_letter_queue();
        broker
            .declare_queue(&queue, QueueOptions::durable())
            .await
            .unwrap();
        assert_eq!(check.check().await.status, HealthStatus::Healthy);

        broker
            .publish("", OutboundMessage::new(queue.clone(), b"lost".to_vec()))
            .await
            .unwrap();
        let health = check.check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.name, "EventbusDeadLettersQueue");

        broker.pause();
        assert_eq!(check.check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_event_dead_letters_check() {
        let dead_letters: Arc<dyn EventDeadLetters<Ping>> =
            Arc::new(MemoryEventDeadLetters::new());
        let check = EventDeadLettersHealthCheck::new(dead_letters.clone());
        assert_eq!(check.check().await.status, HealthStatus::Healthy);

        dead_letters
            .store(&Group::new("audit"), &Ping(EventId::random()))
            .await
            .unwrap();
        assert_eq!(check.check().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness_reports_worst_status() {
        let broker = Arc::new(InMemoryBroker::new());
        let state = HealthState::new("event-bus", "0.1.0").with_check(Arc::new(
            EventBusDeadLettersQueueHealthCheck::new(broker, &naming()),
        ));

        let response = health_router(state.clone())
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = health_router(state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
    }
}
