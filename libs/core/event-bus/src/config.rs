//! Event bus configuration.
//!
//! Everything can be built in code with the `with_*` methods or loaded from
//! the environment with [`EventBusConfig::from_env`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EventBusError;
use crate::naming::{EventBusId, EventBusName};

/// Retry policy applied to failing group listeners.
///
/// `max_retries` counts redeliveries after the first attempt: with
/// `max_retries = 3` a listener is invoked at most four times before the
/// event lands in the dead letters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoffConfiguration {
    max_retries: u32,
    first_backoff: Duration,
    jitter_factor: f64,
}

impl RetryBackoffConfiguration {
    pub const DEFAULT_MAX_RETRIES: u32 = 8;
    pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_millis(100);
    pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

    /// Create a validated configuration.
    ///
    /// The jitter factor must lie in `[0, 1]`.
    pub fn new(
        max_retries: u32,
        first_backoff: Duration,
        jitter_factor: f64,
    ) -> Result<Self, EventBusError> {
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(EventBusError::InvalidArgument(format!(
                "jitter factor must be within [0, 1], got {jitter_factor}"
            )));
        }
        Ok(Self {
            max_retries,
            first_backoff,
            jitter_factor,
        })
    }

    /// No retry at all: the first failure dead-letters the event.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            first_backoff: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_first_backoff(mut self, first_backoff: Duration) -> Self {
        self.first_backoff = first_backoff;
        self
    }

    /// Set the jitter factor, clamped to `[0, 1]`.
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

impl Default for RetryBackoffConfiguration {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            first_backoff: Self::DEFAULT_FIRST_BACKOFF,
            jitter_factor: Self::DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Broker channel pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent broker operations
    pub size: usize,
    /// How long a checkout (and the operation it guards) may take
    pub timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration of one event bus instance
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Namespace rooting every exchange and queue name
    pub name: EventBusName,

    /// Identity of this running instance
    pub event_bus_id: EventBusId,

    /// Group listener retry policy
    pub retry: RetryBackoffConfiguration,

    /// Broker channel pool
    pub pool: PoolConfig,

    /// Concurrent deliveries per group registration (1 keeps FIFO order)
    pub max_concurrent_deliveries: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            name: EventBusName::default(),
            event_bus_id: EventBusId::random(),
            retry: RetryBackoffConfiguration::default(),
            pool: PoolConfig::default(),
            max_concurrent_deliveries: 1,
        }
    }
}

impl EventBusConfig {
    /// Create a configuration for the given namespace with defaults.
    pub fn new(name: EventBusName) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn with_event_bus_id(mut self, event_bus_id: EventBusId) -> Self {
        self.event_bus_id = event_bus_id;
        self
    }

    pub fn with_retry(mut self, retry: RetryBackoffConfiguration) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.size = size.max(1);
        self
    }

    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool.timeout = timeout;
        self
    }

    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> Self {
        self.max_concurrent_deliveries = max.max(1);
        self
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `EVENT_BUS_NAME` | `events` |
    /// | `EVENT_BUS_ID` | random |
    /// | `EVENT_BUS_MAX_RETRIES` | 8 |
    /// | `EVENT_BUS_FIRST_BACKOFF_MS` | 100 |
    /// | `EVENT_BUS_JITTER_FACTOR` | 0.5 |
    /// | `EVENT_BUS_POOL_SIZE` | 10 |
    /// | `EVENT_BUS_POOL_TIMEOUT_MS` | 30000 |
    /// | `EVENT_BUS_MAX_CONCURRENT_DELIVERIES` | 1 |
    pub fn from_env() -> Result<Self, EventBusError> {
        let name = EventBusName::new(env_or_default("EVENT_BUS_NAME", EventBusName::DEFAULT))?;

        let event_bus_id = match env::var("EVENT_BUS_ID") {
            Ok(raw) => raw.parse::<EventBusId>()?,
            Err(_) => EventBusId::random(),
        };

        let retry = RetryBackoffConfiguration::new(
            env_parse("EVENT_BUS_MAX_RETRIES", RetryBackoffConfiguration::DEFAULT_MAX_RETRIES)?,
            Duration::from_millis(env_parse("EVENT_BUS_FIRST_BACKOFF_MS", 100u64)?),
            env_parse(
                "EVENT_BUS_JITTER_FACTOR",
                RetryBackoffConfiguration::DEFAULT_JITTER_FACTOR,
            )?,
        )
        .map_err(|e| EventBusError::Config(e.to_string()))?;

        Ok(Self::new(name)
            .with_event_bus_id(event_bus_id)
            .with_retry(retry)
            .with_pool_size(env_parse("EVENT_BUS_POOL_SIZE", 10usize)?)
            .with_pool_timeout(Duration::from_millis(env_parse(
                "EVENT_BUS_POOL_TIMEOUT_MS",
                30_000u64,
            )?))
            .with_max_concurrent_deliveries(env_parse(
                "EVENT_BUS_MAX_CONCURRENT_DELIVERIES",
                1usize,
            )?))
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, EventBusError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            EventBusError::Config(format!("failed to parse environment variable '{key}': {e}"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let retry = RetryBackoffConfiguration::default();
        assert_eq!(retry.max_retries(), 8);
        assert_eq!(retry.first_backoff(), Duration::from_millis(100));
        assert_eq!(retry.jitter_factor(), 0.5);
    }

    #[test]
    fn test_retry_rejects_jitter_out_of_range() {
        assert!(RetryBackoffConfiguration::new(3, Duration::from_millis(10), 1.5).is_err());
        assert!(RetryBackoffConfiguration::new(3, Duration::from_millis(10), -0.1).is_err());
        assert!(RetryBackoffConfiguration::new(3, Duration::from_millis(10), 1.0).is_ok());
    }

    #[test]
    fn test_builder_clamps_values() {
        let config = EventBusConfig::default()
            .with_pool_size(0)
            .with_max_concurrent_deliveries(0)
            .with_retry(RetryBackoffConfiguration::default().with_jitter_factor(3.0));
        assert_eq!(config.pool.size, 1);
        assert_eq!(config.max_concurrent_deliveries, 1);
        assert_eq!(config.retry.jitter_factor(), 1.0);
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars_unset(
            [
                "EVENT_BUS_NAME",
                "EVENT_BUS_ID",
                "EVENT_BUS_MAX_RETRIES",
                "EVENT_BUS_FIRST_BACKOFF_MS",
                "EVENT_BUS_JITTER_FACTOR",
                "EVENT_BUS_POOL_SIZE",
                "EVENT_BUS_POOL_TIMEOUT_MS",
                "EVENT_BUS_MAX_CONCURRENT_DELIVERIES",
            ],
            || {
                let config = EventBusConfig::from_env().unwrap();
                assert_eq!(config.name.as_str(), "events");
                assert_eq!(config.retry, RetryBackoffConfiguration::default());
                assert_eq!(config.pool, PoolConfig::default());
                assert_eq!(config.max_concurrent_deliveries, 1);
            },
        );
    }

    #[test]
    fn test_from_env_overrides() {
        let id = "5a6e1f0e-3c55-4a5e-9f0c-0d5d4f7f2b11";
        temp_env::with_vars(
            [
                ("EVENT_BUS_NAME", Some("mailbox")),
                ("EVENT_BUS_ID", Some(id)),
                ("EVENT_BUS_MAX_RETRIES", Some("3")),
                ("EVENT_BUS_FIRST_BACKOFF_MS", Some("250")),
                ("EVENT_BUS_JITTER_FACTOR", Some("0")),
                ("EVENT_BUS_POOL_SIZE", Some("4")),
            ],
            || {
                let config = EventBusConfig::from_env().unwrap();
                assert_eq!(config.name.as_str(), "mailbox");
                assert_eq!(config.event_bus_id.to_string(), id);
                assert_eq!(config.retry.max_retries(), 3);
                assert_eq!(config.retry.first_backoff(), Duration::from_millis(250));
                assert_eq!(config.retry.jitter_factor(), 0.0);
                assert_eq!(config.pool.size, 4);
            },
        );
    }

    #[test]
    fn test_from_env_parse_error() {
        temp_env::with_var("EVENT_BUS_MAX_RETRIES", Some("many"), || {
            let err = EventBusConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("EVENT_BUS_MAX_RETRIES"));
        });
    }

    #[test]
    fn test_from_env_invalid_name() {
        temp_env::with_var("EVENT_BUS_NAME", Some("bad-name"), || {
            assert!(EventBusConfig::from_env().is_err());
        });
    }
}
