//! Admin endpoints: dispatch events and manage dead letters.
//!
//! - `POST /events` - dispatch an event, optionally to tenant keys
//! - `GET /dead-letters/groups` - groups holding failed events
//! - `GET /dead-letters/groups/{group}` - failed events of a group
//! - `POST /dead-letters/redeliver` - redeliver every failed event
//! - `POST /dead-letters/groups/{group}/redeliver` - redeliver one group
//! - `DELETE /dead-letters/groups/{group}/{insertion_id}` - drop one entry

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use event_bus::{EventBus, EventBusError, Group, InsertionId, RegistrationKey};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::events::{NodeEvent, TenantKey};

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AdminState {
    bus: Arc<EventBus<NodeEvent>>,
}

impl AdminState {
    pub fn new(bus: Arc<EventBus<NodeEvent>>) -> Self {
        Self { bus }
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Tenants whose key listeners should also receive the event
    #[serde(default)]
    pub tenants: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FailedEvent {
    pub insertion_id: InsertionId,
    pub event: NodeEvent,
}

fn error_response(e: EventBusError) -> ApiError {
    let status = match &e {
        EventBusError::GroupRegistrationNotFound(_) | EventBusError::NotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        EventBusError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// `POST /events`
pub async fn dispatch_handler(
    State(state): State<AdminState>,
    Json(request): Json<DispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event = NodeEvent::new(request.kind, request.payload);
    let keys: Vec<TenantKey> = request.tenants.into_iter().map(TenantKey).collect();
    let keys: Vec<&dyn RegistrationKey> = keys.iter().map(|k| k as &dyn RegistrationKey).collect();

    state
        .bus
        .dispatch(&event, &keys)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event.event_id })),
    ))
}

/// `GET /dead-letters/groups`
pub async fn failed_groups_handler(
    State(state): State<AdminState>,
) -> Result<impl IntoResponse, ApiError> {
    let groups = state
        .bus
        .dead_letters()
        .groups_with_failed_events()
        .await
        .map_err(error_response)?;

    Ok(Json(json!({ "count": groups.len(), "groups": groups })))
}

/// `GET /dead-letters/groups/{group}`
pub async fn failed_events_handler(
    State(state): State<AdminState>,
    Path(group): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = Group::new(group);
    let dead_letters = state.bus.dead_letters();

    let mut events = Vec::new();
    for insertion_id in dead_letters
        .failed_ids(&group)
        .await
        .map_err(error_response)?
    {
        if let Some(event) = dead_letters
            .failed_event(&group, insertion_id)
            .await
            .map_err(error_response)?
        {
            events.push(FailedEvent {
                insertion_id,
                event,
            });
        }
    }

    Ok(Json(json!({
        "group": group,
        "count": events.len(),
        "events": events
    })))
}

/// `POST /dead-letters/redeliver`
pub async fn redeliver_all_handler(
    State(state): State<AdminState>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .bus
        .redeliver_failed_events(None)
        .await
        .map_err(error_response)?;

    info!(
        redelivered = report.redelivered,
        failed = report.failed,
        "Dead letters redelivered"
    );
    Ok(Json(report))
}

/// `POST /dead-letters/groups/{group}/redeliver`
pub async fn redeliver_group_handler(
    State(state): State<AdminState>,
    Path(group): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = Group::new(group);
    let report = state
        .bus
        .redeliver_failed_events(Some(&group))
        .await
        .map_err(error_response)?;

    info!(
        group = %group,
        redelivered = report.redelivered,
        failed = report.failed,
        "Dead letters redelivered"
    );
    Ok(Json(report))
}

/// `DELETE /dead-letters/groups/{group}/{insertion_id}`
pub async fn remove_failed_event_handler(
    State(state): State<AdminState>,
    Path((group, insertion_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let group = Group::new(group);
    let insertion_id: InsertionId = insertion_id.parse().map_err(error_response)?;

    state
        .bus
        .dead_letters()
        .remove(&group, insertion_id)
        .await
        .map_err(error_response)?;

    warn!(group = %group, insertion_id = %insertion_id, "Dead letter removed");
    Ok(StatusCode::NO_CONTENT)
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/events", post(dispatch_handler))
        .route("/dead-letters/groups", get(failed_groups_handler))
        .route("/dead-letters/groups/{group}", get(failed_events_handler))
        .route("/dead-letters/redeliver", post(redeliver_all_handler))
        .route(
            "/dead-letters/groups/{group}/redeliver",
            post(redeliver_group_handler),
        )
        .route(
            "/dead-letters/groups/{group}/{insertion_id}",
            delete(remove_failed_event_handler),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuditListener, routing_key_converter};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use event_bus::{
        EventBusConfig, EventDeadLetters, InMemoryBroker, JsonEventSerializer,
        MemoryEventDeadLetters,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        bus: Arc<EventBus<NodeEvent>>,
        dead_letters: Arc<MemoryEventDeadLetters<NodeEvent>>,
        audit: Arc<AuditListener>,
    }

    async fn fixture() -> Fixture {
        let dead_letters = Arc::new(MemoryEventDeadLetters::new());
        let bus = Arc::new(EventBus::new(
            EventBusConfig::default(),
            Arc::new(InMemoryBroker::new()),
            Arc::new(JsonEventSerializer::new()),
            routing_key_converter().unwrap(),
            dead_letters.clone(),
        ));
        let audit = Arc::new(AuditListener::default());
        bus.register_group(audit.clone(), Group::new("audit"))
            .await
            .unwrap();
        bus.start().await.unwrap();
        Fixture {
            bus,
            dead_letters,
            audit,
        }
    }

    async fn call(bus: &Arc<EventBus<NodeEvent>>, request: Request<Body>) -> (StatusCode, Value) {
        let response = admin_router(AdminState::new(bus.clone()))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn audited(audit: &AuditListener, expected: u64) -> bool {
        for _ in 0..200 {
            if audit.audited() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_dispatch_reaches_the_audit_group() {
        let fixture = fixture().await;

        let (status, body) = call(
            &fixture.bus,
            post_json(
                "/events",
                json!({ "kind": "mailbox.created", "payload": { "id": 7 }, "tenants": ["acme"] }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["event_id"].is_string());
        assert!(audited(&fixture.audit, 1).await);
        fixture.bus.stop().await;
    }

    #[tokio::test]
    async fn test_list_failed_groups_and_events() {
        let fixture = fixture().await;
        let group = Group::new("billing");
        let event = NodeEvent::new("invoice.failed", json!({ "invoice": 42 }));
        let insertion_id = fixture.dead_letters.store(&group, &event).await.unwrap();

        let (status, body) = call(&fixture.bus, get("/dead-letters/groups")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "count": 1, "groups": ["billing"] }));

        let (status, body) = call(&fixture.bus, get("/dead-letters/groups/billing")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(
            body["events"][0]["insertion_id"],
            json!(insertion_id.to_string())
        );
        assert_eq!(body["events"][0]["event"]["kind"], "invoice.failed");
        fixture.bus.stop().await;
    }

    #[tokio::test]
    async fn test_redeliver_group_replays_and_reports() {
        let fixture = fixture().await;
        fixture
            .dead_letters
            .store(&Group::new("audit"), &NodeEvent::new("ping", Value::Null))
            .await
            .unwrap();

        let (status, body) = call(
            &fixture.bus,
            post_json("/dead-letters/groups/audit/redeliver", Value::Null),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "redelivered": 1, "failed": 0 }));
        assert!(audited(&fixture.audit, 1).await);
        assert!(!fixture.dead_letters.contain_events().await.unwrap());
        fixture.bus.stop().await;
    }

    #[tokio::test]
    async fn test_redeliver_all_keeps_undeliverable_entries() {
        let fixture = fixture().await;
        fixture
            .dead_letters
            .store(&Group::new("retired"), &NodeEvent::new("ping", Value::Null))
            .await
            .unwrap();

        let (status, body) = call(
            &fixture.bus,
            post_json("/dead-letters/redeliver", Value::Null),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "redelivered": 0, "failed": 1 }));
        assert!(fixture.dead_letters.contain_events().await.unwrap());
        fixture.bus.stop().await;
    }

    #[tokio::test]
    async fn test_remove_failed_event() {
        let fixture = fixture().await;
        let group = Group::new("billing");
        let insertion_id = fixture
            .dead_letters
            .store(&group, &NodeEvent::new("ping", Value::Null))
            .await
            .unwrap();

        let request = Request::delete(format!("/dead-letters/groups/billing/{insertion_id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&fixture.bus, request).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(fixture.dead_letters.failed_ids(&group).await.unwrap().is_empty());
        fixture.bus.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_insertion_id_is_bad_request() {
        let fixture = fixture().await;

        let request = Request::delete("/dead-letters/groups/billing/not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&fixture.bus, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not-a-uuid"));
        fixture.bus.stop().await;
    }
}
