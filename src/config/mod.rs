//! Application configuration loading and validation.
//!
//! Configuration is loaded from a TOML file. Connection secrets may be kept
//! out of the file and supplied through `FEEDPOOL_ENDPOINT` and
//! `FEEDPOOL_CREDENTIAL` (a `.env` file is honoured by [`Config::load_with_dotenv`]).
//!
//! # Example
//!
//! ```no_run
//! use feedpool::config::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_with_dotenv("config.toml")?;
//!     config.init_logging();
//!     Ok(())
//! }
//! ```

mod logging;
mod pool;

use std::path::Path;

use serde::Deserialize;

pub use logging::LoggingConfig;
pub use pool::{BackoffConfig, PoolConfig, RateLimitConfig};

use crate::error::{ConfigError, Result};

/// Environment variable overriding [`PoolConfig::endpoint`].
pub const ENDPOINT_ENV: &str = "FEEDPOOL_ENDPOINT";

/// Environment variable overriding [`PoolConfig::credential`].
pub const CREDENTIAL_ENV: &str = "FEEDPOOL_CREDENTIAL";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Connection pool settings, including the creation rate limit.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Retry policy shared by monitors.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Logging and tracing configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse configuration from TOML, apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is malformed or validation fails.
    pub fn parse_toml(content: &str) -> Result<Self> {
        Self::parse_toml_with_env(content, |key| std::env::var(key).ok())
    }

    /// Like [`Config::parse_toml`] with an explicit environment lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is malformed or validation fails.
    pub fn parse_toml_with_env<F>(content: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The TOML content is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse_toml(&content)
    }

    /// Load a `.env` file (if present) into the process environment, then
    /// [`load`](Self::load).
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`].
    pub fn load_with_dotenv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load(path)
    }

    /// Initialize tracing from the logging section.
    pub fn init_logging(&self) {
        self.logging.init();
    }

    fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = env(ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            self.pool.endpoint = endpoint;
        }
        if let Some(credential) = env(CREDENTIAL_ENV).filter(|v| !v.is_empty()) {
            self.pool.credential = credential;
        }
    }

    fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.backoff.validate()?;
        Ok(())
    }
}
