//! Event Bus Node - Entry Point
//!
//! Runs one event bus instance against Redis with its admin HTTP server.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_event_bus_node::run().await
}
