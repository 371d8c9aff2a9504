//! Shared worker counters and the circuit breaker
//!
//! Every field is mutated independently through atomics; no invariant spans
//! two fields, so there are no cross-field transactions.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::backoff;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Pulls suspended until the reset period elapses
    Open,
    /// One trial pull allowed
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// What the poll loop may do this iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollGate {
    Pull,
    /// Cooldown elapsed: this is the half-open trial pull
    Trial,
    Wait,
}

#[derive(Debug, Default)]
pub struct WorkerState {
    running: AtomicBool,
    generation: AtomicU64,
    in_flight: AtomicUsize,
    consecutive_failures: AtomicU32,
    circuit: AtomicU8,
    backoff_ms: AtomicU64,
    last_failure_at: Mutex<Option<Instant>>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip `running` on. Returns the new loop generation, or `None` if
    /// already running.
    pub fn begin_run(&self) -> Option<u64> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Flip `running` off. Returns whether it was running.
    pub fn end_run(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Stop only if `generation` is still the live loop
    pub fn end_generation(&self, generation: u64) -> bool {
        self.is_current(generation) && self.end_run()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the loop started as `generation` should keep going
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::SeqCst))
    }

    pub fn circuit(&self) -> CircuitState {
        CircuitState::from_u8(self.circuit.load(Ordering::SeqCst))
    }

    /// Reserve an in-flight slot if fewer than `max` are taken
    pub fn try_acquire_slot(self: &Arc<Self>, max: usize) -> Option<InFlightGuard> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .ok()
            .map(|_| InFlightGuard {
                state: Arc::clone(self),
            })
    }

    /// Record a processing or transport failure.
    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, threshold: u32) -> bool {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        *self.last_failure_lock() = Some(Instant::now());
        let _ = self
            .backoff_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| {
                Some(backoff::grow_idle_backoff(ms))
            });

        if failures >= threshold {
            let previous = self
                .circuit
                .swap(CircuitState::Open.as_u8(), Ordering::SeqCst);
            return previous != CircuitState::Open.as_u8();
        }
        false
    }

    /// Record a successful message: one failure forgiven, backoff x0.7
    pub fn record_success(&self) {
        let _ = self
            .consecutive_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        let _ = self
            .backoff_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| {
                Some(backoff::decay_on_success(ms))
            });
    }

    /// Empty poll: backoff x0.9
    pub fn record_idle(&self) {
        let _ = self
            .backoff_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| {
                Some(backoff::decay_on_idle(ms))
            });
    }

    /// Decide whether the loop may pull now, moving Open -> HalfOpen once
    /// `reset` has elapsed since the last failure.
    pub fn poll_gate(&self, reset: Duration) -> PollGate {
        match self.circuit() {
            CircuitState::Closed | CircuitState::HalfOpen => PollGate::Pull,
            CircuitState::Open => {
                let cooled_down = self
                    .last_failure_lock()
                    .is_none_or(|at| at.elapsed() >= reset);
                if !cooled_down {
                    return PollGate::Wait;
                }
                let moved = self
                    .circuit
                    .compare_exchange(
                        CircuitState::Open.as_u8(),
                        CircuitState::HalfOpen.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if moved { PollGate::Trial } else { PollGate::Wait }
            }
        }
    }

    /// A pull succeeded: a pending half-open trial has passed.
    /// Returns `true` if the circuit closed.
    pub fn close_after_trial(&self) -> bool {
        self.circuit
            .compare_exchange(
                CircuitState::HalfOpen.as_u8(),
                CircuitState::Closed.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn last_failure_lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_failure_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One reserved in-flight slot, released on drop
///
/// Dropping covers every exit path of a processing task, panics included.
pub struct InFlightGuard {
    state: Arc<WorkerState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("in_flight", &self.state.in_flight())
            .finish()
    }
}
