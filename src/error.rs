use std::time::Duration;

use thiserror::Error;

use crate::domain::id::OwnerId;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Errors returned by [`ConnectionPool`](crate::pool::ConnectionPool) operations.
///
/// All variants except [`PoolError::ShutDown`] are transient: the caller owns
/// the retry policy, the pool never retries on its behalf.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection creation rate limit exceeded (next token in {retry_after:?})")]
    RateLimitExceeded { retry_after: Option<Duration> },

    #[error("no connections available: pool full ({max_connections}) with no healthy entry to reassign")]
    NoConnectionsAvailable { max_connections: usize },

    #[error("failed to create connection to {endpoint}: {reason}")]
    ConnectionCreationFailed { endpoint: String, reason: String },

    #[error("owner {owner} holds no pooled connection")]
    NotAcquired { owner: OwnerId },

    #[error("connection pool is shut down")]
    ShutDown,
}

/// Errors raised by the upstream streaming collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream transport error: {0}")]
    Transport(String),

    /// The pool cancelled the stream (release, reassignment, expiry or shutdown).
    #[error("stream cancelled by pool")]
    Cancelled,

    /// Cancelling a stream failed. Always absorbed by the pool.
    #[error("stream cancellation failed: {0}")]
    Cancellation(String),
}

/// Consumer-side fatal errors.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor {owner} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        owner: OwnerId,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("monitor {owner} task ended abnormally: {reason}")]
    TaskFailed { owner: OwnerId, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
