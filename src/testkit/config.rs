//! Canonical test configurations.
//!
//! Single source of truth for config structs used across tests.

use crate::config::{BackoffConfig, PoolConfig, RateLimitConfig};

/// Pool config with the given capacity and a generous rate limit.
///
/// Uses production TTL and health-check timings; tests that need specific
/// timing behavior override individual fields on the returned struct.
pub fn pool(max_connections: usize) -> PoolConfig {
    PoolConfig {
        endpoint: "mock://feed".into(),
        credential: "test-token".into(),
        max_connections,
        connection_ttl_secs: 300,
        health_check_interval_secs: 30,
        cancel_grace_ms: 100,
        connect_timeout_secs: 10,
        shutdown_timeout_ms: 1000,
        stream_buffer: 64,
        rate_limit: RateLimitConfig {
            capacity: 60,
            window_ms: 60_000,
        },
    }
}

/// Fast backoff: 10ms base, 80ms ceiling.
pub fn backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 10,
        max_delay_ms: 80,
        max_attempts,
    }
}
