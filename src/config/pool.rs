//! Connection pool, rate limiter and consumer backoff configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Token-bucket parameters bounding how fast upstream connections are created.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst of connection creations (bucket size).
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: u32,
    /// Window over which `capacity` tokens are refilled (milliseconds).
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

const fn default_rate_limit_capacity() -> u32 {
    60
}

const fn default_rate_limit_window_ms() -> u64 {
    60_000
}

impl RateLimitConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_limit_capacity(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

/// Connection pool configuration. Immutable once the pool is built.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Upstream feed endpoint.
    #[serde(default)]
    pub endpoint: String,
    /// Access credential presented when dialing.
    ///
    /// Usually supplied through `FEEDPOOL_CREDENTIAL` rather than the file.
    #[serde(default)]
    pub credential: String,
    /// Maximum number of live upstream connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum connection age before the health check expires it (seconds).
    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,
    /// Health check interval (seconds).
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Grace period granted to a stream cancellation (milliseconds).
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Upper bound on dialing a new connection (seconds).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Per-entry bound on teardown during shutdown (milliseconds).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Buffered messages between a bound stream and its consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Connection creation rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

const fn default_max_connections() -> usize {
    15
}

const fn default_connection_ttl_secs() -> u64 {
    300 // 5 minutes
}

const fn default_health_check_interval_secs() -> u64 {
    30
}

const fn default_cancel_grace_ms() -> u64 {
    100
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_shutdown_timeout_ms() -> u64 {
    1000
}

const fn default_stream_buffer() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credential: String::new(),
            max_connections: default_max_connections(),
            connection_ttl_secs: default_connection_ttl_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            stream_buffer: default_stream_buffer(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Check required fields and value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for an empty endpoint or
    /// credential and [`ConfigError::InvalidValue`] for zero-valued limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "endpoint" });
        }
        if self.credential.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "credential",
            });
        }

        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            field,
            reason: reason.to_string(),
        };

        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be > 0"));
        }
        if self.connection_ttl_secs == 0 {
            return Err(invalid("connection_ttl_secs", "must be > 0"));
        }
        if self.health_check_interval_secs == 0 {
            return Err(invalid("health_check_interval_secs", "must be > 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs", "must be > 0"));
        }
        if self.stream_buffer == 0 {
            return Err(invalid("stream_buffer", "must be > 0"));
        }
        if self.rate_limit.capacity == 0 {
            return Err(invalid("rate_limit.capacity", "must be > 0"));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Exponential backoff applied by monitors when acquiring a connection fails.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for any single delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before the monitor gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1000 // 1 second
}

fn default_max_delay_ms() -> u64 {
    30000 // 30 seconds
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the delays are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "base_delay_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "max_delay_ms",
                reason: "must be >= base_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}
