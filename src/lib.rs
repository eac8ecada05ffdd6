//! Feedpool - a rate-limited connection pool for long-lived upstream streams.
//!
//! An upstream streaming feed allows only a handful of concurrent
//! connections and throttles how fast new ones may be opened. This crate
//! shares that budget among many independent, long-running consumers.
//!
//! # Modules
//!
//! - [`pool`] - [`ConnectionPool`](pool::ConnectionPool): owner-pinned entries,
//!   LRU reassignment, token-bucket creation limit, TTL health checks
//! - [`monitor`] - [`MonitorAdapter`](monitor::MonitorAdapter): lazy acquisition,
//!   exponential backoff and release-on-stop for consumers
//! - [`port`] - Traits the upstream client must implement
//! - [`config`] - TOML configuration with environment overrides
//! - [`lifecycle`] - Signal-driven pool shutdown
//! - [`error`] - Error types for the crate
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feedpool::config::Config;
//! use feedpool::pool::ConnectionPool;
//! use feedpool::port::Connector;
//!
//! async fn run(connector: Arc<dyn Connector>) -> feedpool::error::Result<()> {
//!     let config = Config::load_with_dotenv("config.toml")?;
//!     config.init_logging();
//!
//!     let pool = ConnectionPool::new(config.pool.clone(), connector)?;
//!     let client = pool.acquire("bonding-curve").await?;
//!     let stream = client.open_stream().await?;
//!     let mut bound = pool.bind_stream("bonding-curve", stream).await?;
//!     while let Some(Ok(message)) = bound.next().await {
//!         println!("{} bytes", message.payload.len());
//!     }
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod pool;
pub mod port;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
