//! Worker core
//!
//! Polls a [`Queue`](crate::queue::Queue), enforces concurrency limits and
//! the circuit breaker, claims each message in an
//! [`IdempotencyStore`](crate::idempotency::IdempotencyStore), runs the
//! [`Handler`](crate::handlers::Handler), and settles the message with an
//! ack, a delayed requeue, or a dead letter.

pub mod backoff;
pub mod events;
pub mod runner;
pub mod state;

pub use events::{DeadLetter, EventBus, WorkerEvent};
pub use runner::{Disposition, ProcessError, StopReport, Worker, WorkerStats};
pub use state::{CircuitState, WorkerState};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker configuration
///
/// Durations deserialize from integers (milliseconds) or human strings
/// such as `"500ms"`, `"15s"`, `"24h"`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Worker name. Claims are keyed `{name}:{message id}:{attempts}`.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_requeue_delay_base", with = "crate::humanize::duration")]
    pub requeue_delay_base: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_idempotency_ttl", with = "crate::humanize::duration")]
    pub idempotency_ttl: Duration,
    #[serde(default = "default_poll_interval", with = "crate::humanize::duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_reset", with = "crate::humanize::duration")]
    pub circuit_reset: Duration,
    /// How long `stop` waits for in-flight messages on shutdown
    #[serde(default = "default_shutdown_grace", with = "crate::humanize::duration")]
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_batch_size: default_max_batch_size(),
            max_concurrent: default_max_concurrent(),
            requeue_delay_base: default_requeue_delay_base(),
            max_attempts: default_max_attempts(),
            idempotency_ttl: default_idempotency_ttl(),
            poll_interval: default_poll_interval(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset: default_circuit_reset(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_name() -> String {
    "worker".to_string()
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    10
}

fn default_requeue_delay_base() -> Duration {
    Duration::from_millis(2000)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_idempotency_ttl() -> Duration {
    Duration::from_secs(86_400)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_circuit_failure_threshold() -> u32 {
    20
}

fn default_circuit_reset() -> Duration {
    Duration::from_millis(15_000)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
