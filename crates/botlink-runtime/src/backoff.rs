//! Reconnect backoff policy
//!
//! Bounded exponential growth with jitter. The returned delays never decrease across
//! consecutive failures and never exceed the configured cap; `reset` returns the
//! schedule to the base delay.

use botlink_core::BackoffConfig;
use std::time::Duration;

/// Exponential backoff schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal(self.attempt);
        let jitter = nominal.mul_f64(self.config.jitter * fastrand::f64());
        let delay = nominal
            .saturating_add(jitter)
            .min(self.config.max_delay)
            .max(self.last_delay);

        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    /// Delay before jitter for a given attempt index, capped
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(1_024) as i32;
        let secs = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        if !secs.is_finite() {
            return self.config.max_delay;
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Return to the base delay (after a successful connection)
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(base_ms: u64, max_ms: u64, multiplier: f64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_to_cap() {
        let mut backoff = Backoff::new(config(100, 1_000, 2.0, 0.0));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(config(50, 5_000, 3.0, 0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_huge_attempt_counts_saturate() {
        let backoff = Backoff::new(config(1_000, 60_000, 10.0, 0.0));
        assert_eq!(backoff.nominal(u32::MAX), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(
            base_ms in 1u64..1_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..=1.0,
            failures in 1usize..40,
        ) {
            let max_ms = base_ms + extra_ms;
            let mut backoff = Backoff::new(config(base_ms, max_ms, multiplier, jitter));
            let mut previous = Duration::ZERO;

            for _ in 0..failures {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max_ms));
                prop_assert!(delay >= Duration::from_millis(base_ms));
                previous = delay;
            }

            backoff.reset();
            let after_reset = backoff.next_delay();
            prop_assert!(after_reset <= Duration::from_millis(base_ms).mul_f64(1.0 + jitter) + Duration::from_millis(1));
        }
    }
}
