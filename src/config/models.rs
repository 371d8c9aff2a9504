use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::observability::TelemetryConfig;
use crate::worker::WorkerConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where idempotency claims are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyBackend {
    /// Process-local map, lost on restart
    #[default]
    Memory,
    /// Fjall keyspace at `path`
    Fjall,
}

/// Idempotency store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
    #[serde(default)]
    pub backend: IdempotencyBackend,
    #[serde(default = "default_idempotency_path")]
    pub path: PathBuf,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            backend: IdempotencyBackend::default(),
            path: default_idempotency_path(),
        }
    }
}

fn default_idempotency_path() -> PathBuf {
    PathBuf::from("data/idempotency")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.worker.name, "worker");
        assert_eq!(config.idempotency.backend, IdempotencyBackend::Memory);
        assert_eq!(config.idempotency.path, PathBuf::from("data/idempotency"));
        assert_eq!(config.telemetry.log_filter, "info");
    }

    #[test]
    fn test_backend_names() {
        let config: IdempotencyConfig =
            serde_json::from_str(r#"{"backend": "fjall", "path": "/var/lib/claims"}"#).unwrap();
        assert_eq!(config.backend, IdempotencyBackend::Fjall);
        assert_eq!(config.path, PathBuf::from("/var/lib/claims"));
    }
}
