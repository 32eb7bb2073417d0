use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use super::Broker;
use crate::config::PoolConfig;
use crate::error::EventBusError;

/// Bounded access to the broker shared by publishers and consumers.
///
/// Every operation checks out a channel permit and must complete within the
/// configured timeout, otherwise it fails with a transient broker error.
#[derive(Clone)]
pub struct ChannelPool {
    broker: Arc<dyn Broker>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ChannelPool {
    pub fn new(broker: Arc<dyn Broker>, config: PoolConfig) -> Self {
        Self {
            broker,
            permits: Arc::new(Semaphore::new(config.size.max(1))),
            timeout: config.timeout,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn available_channels(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one broker operation on a pooled channel.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, EventBusError>
    where
        F: FnOnce(Arc<dyn Broker>) -> Fut,
        Fut: Future<Output = Result<T, EventBusError>>,
    {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let _permit = tokio::time::timeout_at(deadline, self.permits.acquire())
            .await
            .map_err(|_| {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Channel pool checkout timed out"
                );
                EventBusError::transient(format!("timed out acquiring a channel for {operation}"))
            })?
            .map_err(|e| EventBusError::transient_with_source("channel pool closed", e))?;

        tokio::time::timeout_at(deadline, f(Arc::clone(&self.broker)))
            .await
            .map_err(|_| EventBusError::transient(format!("broker {operation} timed out")))?
    }
}
