use std::time::Duration;

use crate::backoff::WaitDelayGenerator;

/// Per-message retry state of a group delivery.
///
/// ```text
/// Active(n) ──fail──▶ AwaitingRetry(n+1) ──redeliver──▶ Active(n+1) ──fail──▶ ...
///     │                                                      │
///     └────────────── fail with n+1 > max_retries ───────────┴──▶ DeadLettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Delivered to the listener; `retry_count` redeliveries happened before.
    Active { retry_count: u32 },
    /// Parked in the retry queue for `delay`.
    AwaitingRetry { retry_count: u32, delay: Duration },
    /// Retries exhausted after `attempts` invocations.
    DeadLettered { attempts: u32 },
}

impl DeliveryState {
    pub fn received(retry_count: u32) -> Self {
        Self::Active { retry_count }
    }

    /// Transition after the listener failed.
    pub fn fail(self, delays: &WaitDelayGenerator) -> Self {
        match self {
            Self::Active { retry_count } => {
                let next = retry_count.saturating_add(1);
                if next <= delays.max_retries() {
                    Self::AwaitingRetry {
                        retry_count: next,
                        delay: delays.generate_delay(next),
                    }
                } else {
                    Self::DeadLettered { attempts: next }
                }
            }
            other => other,
        }
    }

    /// Transition once the retry delay elapsed.
    pub fn redeliver(self) -> Self {
        match self {
            Self::AwaitingRetry { retry_count, .. } => Self::Active { retry_count },
            other => other,
        }
    }
}
