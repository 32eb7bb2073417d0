//! Event listeners.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::ListenerError;
use crate::event::Event;

/// How the bus runs a listener invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Invoked on the delivering task
    #[default]
    Synchronous,
    /// Invoked on its own spawned task
    Asynchronous,
}

/// Receives events from the bus.
///
/// # Example
///
/// ```ignore
/// struct Indexer { index: SearchIndex }
///
/// #[async_trait]
/// impl EventListener<MailboxEvent> for Indexer {
///     async fn event(&self, event: &MailboxEvent) -> Result<(), ListenerError> {
///         self.index.update(event).await.map_err(|e| ListenerError::with_source("index", e))
///     }
/// }
/// ```
#[async_trait]
pub trait EventListener<E: Event>: Send + Sync + 'static {
    /// Handle one event. Failures of group listeners are retried.
    async fn event(&self, event: &E) -> Result<(), ListenerError>;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Synchronous
    }

    /// Events this returns `false` for are acknowledged without invocation.
    fn is_handling(&self, _event: &E) -> bool {
        true
    }

    /// Name used in logs and metric labels
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Run a listener per its execution mode and wait for the outcome.
///
/// A panicking listener is reported as a failure.
pub(crate) async fn invoke<E: Event>(
    listener: &Arc<dyn EventListener<E>>,
    event: &E,
) -> Result<(), ListenerError> {
    match listener.execution_mode() {
        ExecutionMode::Synchronous => AssertUnwindSafe(listener.event(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ListenerError::new("listener panicked"))),
        ExecutionMode::Asynchronous => {
            let listener = Arc::clone(listener);
            let event = event.clone();
            tokio::spawn(async move { listener.event(&event).await })
                .await
                .unwrap_or_else(|e| Err(ListenerError::with_source("listener task failed", e)))
        }
    }
}
