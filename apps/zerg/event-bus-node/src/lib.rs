//! Event Bus Node
//!
//! One running instance of the event bus, backed by Redis.
//!
//! ## Architecture
//!
//! ```text
//! POST /events
//!   ↓
//! EventBus<NodeEvent>
//!   ↓ (exchange: {name}-exchange)
//! RedisBroker ──→ {name}-workQueue-audit ──→ AuditListener
//!   │                 ↓ (failures, with backoff)
//!   │             {name}-retryQueue-audit
//!   └──→ {name}-eventbus-{id} (tenant key listeners, this instance only)
//!
//! Exhausted retries ──→ RedisEventDeadLetters ──→ /dead-letters/* admin
//! ```
//!
//! ## Features
//!
//! - Durable group delivery shared by every node of the namespace
//! - Retry with exponential backoff, then application dead letters
//! - Dead letter inspection and redelivery over HTTP
//! - Health, readiness and Prometheus endpoints
//! - Graceful shutdown handling

pub mod admin;
pub mod config;
pub mod events;
pub mod telemetry;

use axum::Router;
use event_bus::{
    EventBus, EventBusDeadLettersQueueHealthCheck, EventDeadLettersHealthCheck, Group,
    HealthState, JsonEventSerializer, RedisBroker, RedisEventDeadLetters, health_router, metrics,
};
use eyre::{Result, WrapErr};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::admin::{AdminState, admin_router};
use crate::config::NodeConfig;
use crate::events::{AuditListener, NodeEvent, routing_key_converter};
use crate::telemetry::Environment;

/// Start the health and admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
/// - Dispatch and dead letter admin: `/events`, `/dead-letters/*`
async fn start_admin_server(
    app: Router,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Connect to Redis, failing fast when it is unreachable.
async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).wrap_err("Invalid Redis URL")?;
    let manager = ConnectionManager::new(client)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .wrap_err("Redis did not answer PING")?;

    Ok(manager)
}

/// Run the event bus node
///
/// This is the main entry point for the node. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects the broker and the dead letters to Redis
/// 3. Registers the audit group and starts the bus
/// 4. Serves health and admin endpoints until a shutdown signal
///
/// # Errors
///
/// Returns an error if:
/// - The configuration is invalid
/// - Redis connection fails
/// - The bus topology cannot be declared
pub async fn run() -> Result<()> {
    telemetry::install_color_eyre();
    let environment = Environment::from_env();
    telemetry::init_tracing(&environment);

    metrics::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting event bus node"
    );

    let config = NodeConfig::from_env()?;
    info!(
        namespace = %config.bus.name,
        event_bus_id = %config.bus.event_bus_id,
        max_retries = config.bus.retry.max_retries(),
        pool_size = config.bus.pool.size,
        max_concurrent_deliveries = config.bus.max_concurrent_deliveries,
        "Event bus configuration loaded"
    );

    info!("Connecting to Redis...");
    let redis = connect_redis(&config.redis_url).await?;
    info!("Connected to Redis successfully");

    let serializer = Arc::new(JsonEventSerializer::<NodeEvent>::new());
    let broker = Arc::new(RedisBroker::new(redis.clone()));
    let dead_letters = Arc::new(RedisEventDeadLetters::new(
        redis,
        &config.bus.name,
        serializer.clone(),
    ));
    let converter = routing_key_converter().wrap_err("Invalid routing key converter")?;

    let bus = Arc::new(EventBus::<NodeEvent>::new(
        config.bus.clone(),
        broker.clone(),
        serializer,
        converter,
        dead_letters.clone(),
    ));

    if let Some(group) = &config.audit_group {
        bus.register_group(Arc::new(AuditListener::default()), Group::new(group.as_str()))
            .await
            .wrap_err_with(|| format!("Failed to register audit group '{group}'"))?;
    }

    bus.start().await.wrap_err("Failed to start event bus")?;
    info!(groups = ?bus.registered_groups().await, "Event bus started");

    // Set up a shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .with_check(Arc::new(EventBusDeadLettersQueueHealthCheck::new(
            broker,
            bus.naming(),
        )))
        .with_check(Arc::new(EventDeadLettersHealthCheck::<NodeEvent>::new(
            dead_letters,
        )));

    let app = health_router(health_state).merge(admin_router(AdminState::new(bus.clone())));

    if let Err(e) = start_admin_server(app, config.health_port, shutdown_rx).await {
        warn!(error = %e, "Admin server stopped with an error");
    }

    info!("Stopping event bus...");
    bus.stop().await;

    info!("Event bus node stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
