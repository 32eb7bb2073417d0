//! Jittered exponential backoff for group retries.

use std::time::Duration;

use crate::config::RetryBackoffConfiguration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Computes the delay before the n-th retry of a failed delivery.
///
/// `delay(n) = first_backoff * 2^(n-1)` randomized uniformly within
/// `±jitter_factor` of that base. Retry count 0 means no retry yet and yields
/// no delay.
#[derive(Debug, Clone, Copy)]
pub struct WaitDelayGenerator {
    config: RetryBackoffConfiguration,
}

impl WaitDelayGenerator {
    pub fn new(config: RetryBackoffConfiguration) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries()
    }

    pub fn generate_delay(&self, retry_count: u32) -> Duration {
        self.delay_with(retry_count, rand::random::<f64>())
    }

    /// Delay for a given uniform sample in `[0, 1)`.
    fn delay_with(&self, retry_count: u32, sample: f64) -> Duration {
        if retry_count == 0
            || self.config.max_retries() == 0
            || self.config.first_backoff().is_zero()
        {
            return Duration::ZERO;
        }

        let jitter = self.config.jitter_factor();
        if jitter == 0.0 {
            return self.base_delay(retry_count);
        }

        let base = self.base_delay(retry_count).as_secs_f64();
        let low = base * (1.0 - jitter);
        let high = base * (1.0 + jitter);
        let delay = low + (high - low) * sample.clamp(0.0, 1.0);

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Exponential base before jitter, saturating on overflow.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let first_backoff = self.config.first_backoff();
        if first_backoff.is_zero() {
            return Duration::ZERO;
        }
        1u128
            .checked_shl(retry_count - 1)
            .and_then(|factor| first_backoff.as_nanos().checked_mul(factor))
            .and_then(duration_from_nanos)
            .unwrap_or(Duration::MAX)
    }
}

fn duration_from_nanos(nanos: u128) -> Option<Duration> {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
    Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(max_retries: u32, first_backoff_ms: u64, jitter: f64) -> WaitDelayGenerator {
        WaitDelayGenerator::new(
            RetryBackoffConfiguration::new(
                max_retries,
                Duration::from_millis(first_backoff_ms),
                jitter,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_retry_count_zero_has_no_delay() {
        assert_eq!(generator(3, 100, 0.5).generate_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_exact_sequence_without_jitter() {
        let generator = generator(8, 100, 0.0);
        let delays: Vec<_> = (1..=4).map(|n| generator.generate_delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for jitter in [0.1, 0.5, 1.0] {
            let generator = generator(8, 100, jitter);
            for retry_count in 1..=6u32 {
                let base = 100.0 * 2f64.powi(retry_count as i32 - 1);
                for _ in 0..50 {
                    let delay = generator.generate_delay(retry_count).as_secs_f64() * 1000.0;
                    assert!(delay >= base * (1.0 - jitter) - 1e-6, "{delay} below range");
                    assert!(delay <= base * (1.0 + jitter) + 1e-6, "{delay} above range");
                }
            }
        }
    }

    #[test]
    fn test_sample_edges() {
        let generator = generator(8, 100, 0.5);
        assert_eq!(generator.delay_with(1, 0.0), Duration::from_millis(50));
        assert_eq!(generator.delay_with(2, 1.0), Duration::from_millis(300));
    }

    #[test]
    fn test_zero_when_retries_disabled() {
        for retry_count in 0..5 {
            assert_eq!(generator(0, 100, 0.5).generate_delay(retry_count), Duration::ZERO);
            assert_eq!(generator(5, 0, 1.0).generate_delay(retry_count), Duration::ZERO);
        }
    }

    #[test]
    fn test_large_retry_count_saturates() {
        let generator = generator(u32::MAX, 1000, 0.0);
        assert_eq!(generator.base_delay(200), Duration::MAX);
        assert_eq!(generator.base_delay(u32::MAX), Duration::MAX);
        assert_eq!(generator.generate_delay(200), Duration::MAX);
    }

    #[test]
    fn test_doubling_continues_past_u32_factors() {
        let generator = generator(u32::MAX, 1, 0.0);
        assert_eq!(generator.base_delay(33), Duration::from_millis(1 << 32));
        assert_eq!(generator.base_delay(41), Duration::from_millis(1 << 40));
        assert!(generator.base_delay(74) < Duration::MAX);
        // 2^75 ms no longer fits in a Duration
        assert_eq!(generator.base_delay(76), Duration::MAX);
    }

    #[test]
    fn test_zero_backoff_stays_zero_for_any_count() {
        assert_eq!(generator(u32::MAX, 0, 0.0).base_delay(500), Duration::ZERO);
    }
}
