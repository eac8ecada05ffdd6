//! Token-bucket rate limiter for connection creation.
//!
//! Non-blocking: callers ask for a token and get an immediate yes or no.
//! Retry policy belongs to the caller.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Bucket contents in units of `1 / window_ns` tokens, so a refill of
/// `elapsed_ns * capacity` units is exact.
#[derive(Debug)]
struct Bucket {
    units: u128,
    last_refill: Instant,
}

/// Token bucket with capacity `C` refilled at `C / W` tokens per unit of time.
///
/// Uses the monotonic tokio clock, so wall-clock adjustments never mint or
/// destroy tokens (and paused test clocks drive it deterministically).
/// Arithmetic is integral: after waiting exactly `W / C` a spent token is
/// whole again.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window_ns: u128,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket of `capacity` tokens refilled over `window`.
    ///
    /// A window shorter than one millisecond is treated as one millisecond.
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        let window_ns = window.as_nanos().max(1_000_000);
        Self {
            capacity,
            window_ns,
            bucket: Mutex::new(Bucket {
                units: u128::from(capacity) * window_ns,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a limiter from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.window())
    }

    /// Take `n` tokens if available.
    ///
    /// `n == 0` always succeeds; `n` above capacity never does.
    pub fn try_acquire(&self, n: u32) -> bool {
        if n > self.capacity {
            return false;
        }
        let cost = self.units_for(n);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.units >= cost {
            bucket.units -= cost;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available_tokens(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        u32::try_from(bucket.units / self.window_ns).unwrap_or(self.capacity)
    }

    /// Time until `n` tokens will be available; `None` if `n` exceeds capacity.
    pub fn time_until_available(&self, n: u32) -> Option<Duration> {
        if n > self.capacity {
            return None;
        }
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        let missing = self.units_for(n).saturating_sub(bucket.units);
        let rate = u128::from(self.capacity).max(1);
        let nanos = missing.div_ceil(rate);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    fn units_for(&self, tokens: u32) -> u128 {
        u128::from(tokens) * self.window_ns
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed_ns = now.saturating_duration_since(bucket.last_refill).as_nanos();
        if elapsed_ns > 0 {
            let added = elapsed_ns.saturating_mul(u128::from(self.capacity));
            bucket.units = bucket
                .units
                .saturating_add(added)
                .min(self.units_for(self.capacity));
            bucket.last_refill = now;
        }
    }
}
