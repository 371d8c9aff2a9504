use super::models::{Config, IdempotencyBackend};
use crate::worker::WorkerConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Worker name must not be empty")]
    EmptyWorkerName,

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("Fjall idempotency backend requires a non-empty path")]
    MissingIdempotencyPath,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_worker(&config.worker)?;
    validate_idempotency(config)?;
    Ok(())
}

/// Reject worker settings that would stall or spin the poll loop
pub fn validate_worker(worker: &WorkerConfig) -> Result<(), ValidationError> {
    if worker.name.trim().is_empty() {
        return Err(ValidationError::EmptyWorkerName);
    }

    let positive = [
        ("worker.max_batch_size", worker.max_batch_size > 0),
        ("worker.max_concurrent", worker.max_concurrent > 0),
        ("worker.max_attempts", worker.max_attempts > 0),
        (
            "worker.circuit_failure_threshold",
            worker.circuit_failure_threshold > 0,
        ),
        ("worker.poll_interval", !worker.poll_interval.is_zero()),
    ];

    for (field, ok) in positive {
        if !ok {
            return Err(ValidationError::MustBePositive { field });
        }
    }

    Ok(())
}

fn validate_idempotency(config: &Config) -> Result<(), ValidationError> {
    if config.idempotency.backend == IdempotencyBackend::Fjall
        && config.idempotency.path.as_os_str().is_empty()
    {
        return Err(ValidationError::MissingIdempotencyPath);
    }
    Ok(())
}
