//! Exponential backoff schedule for monitor reconnection.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Counts consecutive failures and yields the delay before the next attempt.
///
/// The delay after failure `k` (1-based) is
/// `min(max_delay, base_delay * 2^(k-1))`. Once more than `max_attempts`
/// consecutive failures have been recorded the schedule is exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure. Returns the delay to wait, or `None` when exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.config.max_attempts {
            return None;
        }
        Some(self.delay_for(self.failures))
    }

    /// Delay after the `failure`-th consecutive failure.
    #[must_use]
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Clear the failure count after a healthy connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(config(10));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.record_failure().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(config(2));
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_none());
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(config(2));
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn huge_exponents_saturate() {
        let backoff = Backoff::new(config(u32::MAX));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(1000));
    }
}
