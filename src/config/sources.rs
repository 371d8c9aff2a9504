use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "POLLWORK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/pollwork.toml";
const ENV_PREFIX: &str = "POLLWORK";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    load_from_sources(config_path)
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // POLLWORK__WORKER__MAX_CONCURRENT -> worker.max_concurrent
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyBackend;
    use crate::observability::LogFormat;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.worker.max_concurrent, 10);
        assert_eq!(config.idempotency.backend, IdempotencyBackend::Memory);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[worker]
name = "billing"
max_concurrent = 4
poll_interval = "250ms"
idempotency_ttl = "1h"
circuit_reset = 5000

[idempotency]
backend = "fjall"
path = "data/claims"

[telemetry]
log_filter = "pollwork=debug"
log_format = "json"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.worker.name, "billing");
        assert_eq!(config.worker.max_concurrent, 4);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.idempotency_ttl, Duration::from_secs(3600));
        assert_eq!(config.worker.circuit_reset, Duration::from_secs(5));
        assert_eq!(config.worker.max_batch_size, 10);
        assert_eq!(config.idempotency.backend, IdempotencyBackend::Fjall);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
    }

    // Environment overrides are not exercised here: mutating the process
    // environment is unsafe while other tests run in parallel.
}
