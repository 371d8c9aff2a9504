//! Configuration management for pollwork
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use pollwork::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Worker {} runs {} handlers at once", config.worker.name, config.worker.max_concurrent);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `POLLWORK__<section>__<key>`
//!
//! Examples:
//! - `POLLWORK__WORKER__MAX_CONCURRENT=32`
//! - `POLLWORK__WORKER__POLL_INTERVAL=1s`
//! - `POLLWORK__IDEMPOTENCY__BACKEND=fjall`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/pollwork.toml`.
//! This can be overridden using the `POLLWORK_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::observability::{LogFormat, TelemetryConfig};
pub use crate::worker::WorkerConfig;
pub use models::{Config, IdempotencyBackend, IdempotencyConfig};
pub use validation::{ValidationError, validate_worker};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`POLLWORK__*`)
    /// 2. TOML file (default: `config/pollwork.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
