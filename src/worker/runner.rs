//! Poll loop and per-message processing

use bon::bon;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::WorkerConfig;
use super::backoff;
use super::events::{DeadLetter, EventBus, WorkerEvent};
use super::state::{CircuitState, InFlightGuard, PollGate, WorkerState};
use crate::handlers::{Handler, HandlerError};
use crate::idempotency::{ClaimStatus, IdempotencyError, IdempotencyStore};
use crate::message::Message;
use crate::observability::{MetricsSnapshot, WorkerMetrics};
use crate::queue::{Queue, QueueError};
use crate::scoring::{self, ScoreContext, Scorer};

/// Sleep while every slot is taken
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(10);
/// Lower bound for the pull wait hint
const MIN_PULL_WAIT: Duration = Duration::from_millis(50);
/// How often `stop` re-checks the in-flight count
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why one processing attempt failed
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("idempotency claim failed: {0}")]
    Claim(#[from] IdempotencyError),
}

/// How one processing attempt was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Handler succeeded, message acked
    Processed,
    /// Claim already held, message acked without running the handler
    Duplicate,
    /// Handler failed, message requeued with `attempts`
    Requeued { attempts: u32, delay: Duration },
    /// Attempts exhausted, message acked and reported
    DeadLettered { attempts: u32 },
    /// Not processed, handed back to the queue untouched
    Released,
}

/// Result of [`Worker::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Tasks still running when `stop` returned
    pub in_flight: usize,
    pub drained: bool,
}

/// Point-in-time view of the worker state
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub running: bool,
    pub in_flight: usize,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub backoff: Duration,
}

/// At-least-once queue worker
///
/// Cheap to clone; clones share the same state and poll loop.
///
/// ```rust,ignore
/// let worker = Worker::builder()
///     .queue(queue)
///     .idempotency(Arc::new(MemoryIdempotencyStore::new()))
///     .handler(Arc::new(registry))
///     .config(config.worker)
///     .build();
///
/// let mut events = worker.subscribe();
/// worker.start();
/// // ...
/// worker.stop(Duration::from_secs(30)).await;
/// ```
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    config: WorkerConfig,
    queue: Arc<dyn Queue>,
    idempotency: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn Handler>,
    scorer: Option<Arc<dyn Scorer>>,
    state: Arc<WorkerState>,
    events: EventBus,
    metrics: WorkerMetrics,
}

#[bon]
impl Worker {
    #[builder]
    pub fn new(
        queue: Arc<dyn Queue>,
        idempotency: Arc<dyn IdempotencyStore>,
        handler: Arc<dyn Handler>,
        scorer: Option<Arc<dyn Scorer>>,
        #[builder(default)] config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                config,
                queue,
                idempotency,
                handler,
                scorer,
                state: Arc::new(WorkerState::new()),
                events: EventBus::default(),
                metrics: WorkerMetrics::new(),
            }),
        }
    }
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Receive lifecycle events emitted after this call
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    pub fn stats(&self) -> WorkerStats {
        let state = &self.inner.state;
        WorkerStats {
            running: state.is_running(),
            in_flight: state.in_flight(),
            consecutive_failures: state.consecutive_failures(),
            circuit: state.circuit(),
            backoff: state.backoff(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Start the poll loop on the current tokio runtime
    ///
    /// Returns immediately. Calling `start` on a running worker does nothing.
    pub fn start(&self) {
        let Some(generation) = self.inner.state.begin_run() else {
            debug!(worker = %self.inner.config.name, "Worker already running");
            return;
        };

        info!(
            worker = %self.inner.config.name,
            generation,
            max_concurrent = self.inner.config.max_concurrent,
            max_batch_size = self.inner.config.max_batch_size,
            "Worker started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let poll_loop = tokio::spawn(Arc::clone(&inner).run(generation));
            if let Err(err) = poll_loop.await {
                if let Some(reason) = panic_reason(err) {
                    inner.fatal(generation, reason);
                }
            }
        });
    }

    /// Stop pulling and wait up to `grace` for in-flight messages
    ///
    /// Started handlers are never cancelled. Always returns; check
    /// [`StopReport::in_flight`] for tasks still running.
    pub async fn stop(&self, grace: Duration) -> StopReport {
        let state = &self.inner.state;
        let worker = &self.inner.config.name;

        if state.end_run() {
            info!(
                worker = %worker,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                in_flight = state.in_flight(),
                "Stopping worker"
            );
        }

        // No representable deadline: wait until drained
        let deadline = Instant::now().checked_add(grace);
        loop {
            if state.in_flight() == 0 {
                break;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    STOP_POLL_INTERVAL.min(deadline - now)
                }
                None => STOP_POLL_INTERVAL,
            };
            sleep(pause).await;
        }

        let in_flight = state.in_flight();
        if in_flight == 0 {
            info!(worker = %worker, "Worker stopped");
        } else {
            warn!(
                worker = %worker,
                in_flight,
                "Grace period expired with messages still in flight"
            );
        }

        self.inner.events.emit(WorkerEvent::Stopped { in_flight });
        StopReport {
            in_flight,
            drained: in_flight == 0,
        }
    }

    /// Process one message outside the poll loop
    ///
    /// Waits for a free concurrency slot, then runs the same claim, handle,
    /// settle sequence as a polled message.
    pub async fn process(&self, message: Message) -> Disposition {
        let slot = loop {
            if let Some(slot) = self
                .inner
                .state
                .try_acquire_slot(self.inner.config.max_concurrent)
            {
                break slot;
            }
            sleep(BACKPRESSURE_DELAY).await;
        };
        self.inner.process_in_slot(slot, message).await
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>, generation: u64) {
        let config = &self.config;

        while self.state.is_current(generation) {
            match self.state.poll_gate(config.circuit_reset) {
                PollGate::Wait => {
                    sleep(config.poll_interval).await;
                    continue;
                }
                PollGate::Trial => {
                    info!(worker = %config.name, "Circuit half-open, attempting trial pull");
                    self.events.emit(WorkerEvent::CircuitHalfOpen);
                }
                PollGate::Pull => {}
            }

            let in_flight = self.state.in_flight();
            if in_flight >= config.max_concurrent {
                sleep(BACKPRESSURE_DELAY).await;
                continue;
            }

            let batch_size = config
                .max_batch_size
                .min((config.max_concurrent - in_flight).max(1));
            let wait = config.poll_interval.max(MIN_PULL_WAIT);

            let batch = match self.queue.pull(batch_size, wait).await {
                Ok(batch) => batch,
                Err(err) => {
                    self.pull_failed(&err);
                    sleep(config.poll_interval + self.state.backoff()).await;
                    continue;
                }
            };

            if self.state.close_after_trial() {
                info!(worker = %config.name, "Trial pull succeeded, circuit closed");
                self.events.emit(WorkerEvent::CircuitClosed);
            }

            if batch.is_empty() {
                sleep(config.poll_interval + self.state.backoff()).await;
                self.state.record_idle();
                continue;
            }

            debug!(worker = %config.name, count = batch.len(), "Pulled batch");

            let ctx = ScoreContext {
                worker: config.name.clone(),
                in_flight: self.state.in_flight(),
                max_concurrent: config.max_concurrent,
            };
            let batch = scoring::prioritize(self.scorer.as_ref(), batch, &ctx).await;

            self.dispatch(batch, generation).await;
            tokio::task::yield_now().await;
        }

        info!(worker = %config.name, generation, "Poll loop exited");
    }

    async fn dispatch(self: &Arc<Self>, batch: Vec<Message>, generation: u64) {
        for message in batch {
            if !self.state.is_current(generation) {
                self.release(message).await;
                continue;
            }

            match self.state.try_acquire_slot(self.config.max_concurrent) {
                Some(slot) => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.process_in_slot(slot, message).await;
                    });
                }
                None => {
                    self.release(message).await;
                }
            }
        }
    }

    async fn process_in_slot(&self, _slot: InFlightGuard, message: Message) -> Disposition {
        let key = self.claim_key(&message);

        match self.idempotency.acquire(&key, self.config.idempotency_ttl).await {
            Ok(true) => {}
            Ok(false) => return self.skip_duplicate(message).await,
            Err(err) => return self.fail(message, None, err.into()).await,
        }

        debug!(
            worker = %self.config.name,
            message_id = %message.id,
            kind = %message.kind,
            attempts = message.attempts,
            "Processing message"
        );

        match self.invoke_handler(&message).await {
            Ok(()) => self.complete(message, &key).await,
            Err(err) => self.fail(message, Some(&key), err.into()).await,
        }
    }

    /// Run the handler in its own task so a panic becomes a failed attempt
    async fn invoke_handler(&self, message: &Message) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        let input = message.clone();

        match tokio::spawn(async move { handler.handle(&input).await }).await {
            Ok(result) => result,
            Err(err) => Err(HandlerError::Panicked(
                panic_reason(err).unwrap_or_else(|| "handler task cancelled".to_string()),
            )),
        }
    }

    async fn complete(&self, message: Message, key: &str) -> Disposition {
        if let Err(err) = self.queue.ack(&message).await {
            self.queue_op_failed("ack", &message, &err);
        }

        self.record_result(
            key,
            ClaimStatus::Success,
            json!({ "attempts": message.attempts.saturating_add(1) }),
        )
        .await;

        self.state.record_success();
        self.metrics.message_processed();
        debug!(
            worker = %self.config.name,
            message_id = %message.id,
            "Message processed"
        );
        self.events.emit(WorkerEvent::Processed(message));
        Disposition::Processed
    }

    async fn skip_duplicate(&self, message: Message) -> Disposition {
        debug!(
            worker = %self.config.name,
            message_id = %message.id,
            attempts = message.attempts,
            "Claim already held, acking duplicate delivery"
        );

        if let Err(err) = self.queue.ack(&message).await {
            self.queue_op_failed("ack", &message, &err);
        }

        self.metrics.duplicate_skipped();
        self.events.emit(WorkerEvent::Duplicate(message));
        Disposition::Duplicate
    }

    /// Retry with backoff, or dead-letter once attempts are exhausted
    async fn fail(&self, message: Message, key: Option<&str>, cause: ProcessError) -> Disposition {
        match &cause {
            ProcessError::Handler(_) => self.metrics.handler_failed(),
            ProcessError::Claim(_) => self.metrics.transport_failed(),
        }
        self.record_failure();

        let attempts = message.attempts.saturating_add(1);
        let reason = cause.to_string();

        if attempts >= self.config.max_attempts {
            error!(
                worker = %self.config.name,
                message_id = %message.id,
                kind = %message.kind,
                attempts,
                error = %reason,
                "Message exhausted attempts, dead-lettering"
            );

            if let Err(err) = self.queue.ack(&message).await {
                self.queue_op_failed("ack", &message, &err);
            }
            if let Some(key) = key {
                self.record_result(
                    key,
                    ClaimStatus::Failed,
                    json!({ "error": reason, "attempts": attempts, "dead_letter": true }),
                )
                .await;
            }

            self.metrics.message_dead_lettered();
            self.events.emit(WorkerEvent::DeadLetter(DeadLetter {
                message,
                error: reason,
                attempts,
                failed_at: Utc::now(),
            }));
            return Disposition::DeadLettered { attempts };
        }

        let delay = backoff::requeue_delay(self.config.requeue_delay_base, attempts, backoff::jitter());
        let retry = message.next_attempt(attempts);

        warn!(
            worker = %self.config.name,
            message_id = %retry.id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Message failed, requeueing"
        );

        if let Err(err) = self.queue.requeue(&retry, delay).await {
            self.queue_op_failed("requeue", &retry, &err);
        }
        if let Some(key) = key {
            self.record_result(
                key,
                ClaimStatus::Failed,
                json!({ "error": reason, "attempts": attempts, "retry_in_ms": delay.as_millis() as u64 }),
            )
            .await;
        }

        self.metrics.message_requeued();
        self.events.emit(WorkerEvent::Requeued {
            message: retry,
            delay,
        });
        Disposition::Requeued { attempts, delay }
    }

    /// Hand a message back to the queue without counting an attempt
    async fn release(&self, message: Message) -> Disposition {
        debug!(
            worker = %self.config.name,
            message_id = %message.id,
            "No slot for message, releasing it to the queue"
        );
        if let Err(err) = self.queue.requeue(&message, Duration::ZERO).await {
            self.queue_op_failed("release", &message, &err);
        }
        Disposition::Released
    }

    async fn record_result(&self, key: &str, status: ClaimStatus, meta: serde_json::Value) {
        if let Err(err) = self.idempotency.set_result(key, status, meta).await {
            warn!(
                worker = %self.config.name,
                key,
                %status,
                error = %err,
                "Failed to record idempotency result"
            );
        }
    }

    fn pull_failed(&self, err: &QueueError) {
        warn!(
            worker = %self.config.name,
            error = %err,
            backoff_ms = self.state.backoff().as_millis() as u64,
            "Pull failed"
        );
        self.metrics.transport_failed();
        self.record_failure();
    }

    fn queue_op_failed(&self, operation: &str, message: &Message, err: &QueueError) {
        warn!(
            worker = %self.config.name,
            operation,
            message_id = %message.id,
            error = %err,
            "Queue operation failed"
        );
        self.metrics.transport_failed();
        self.record_failure();
    }

    fn record_failure(&self) {
        if self
            .state
            .record_failure(self.config.circuit_failure_threshold)
        {
            let consecutive_failures = self.state.consecutive_failures();
            warn!(
                worker = %self.config.name,
                consecutive_failures,
                reset_ms = self.config.circuit_reset.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.events
                .emit(WorkerEvent::CircuitOpened { consecutive_failures });
        }
    }

    fn fatal(&self, generation: u64, reason: String) {
        error!(worker = %self.config.name, error = %reason, "Poll loop crashed");
        self.state.end_generation(generation);
        self.events.emit(WorkerEvent::Fatal { error: reason });
    }

    fn claim_key(&self, message: &Message) -> String {
        format!("{}:{}:{}", self.config.name, message.id, message.attempts)
    }
}

/// Panic payload as text; `None` if the task was cancelled instead
fn panic_reason(err: JoinError) -> Option<String> {
    if !err.is_panic() {
        return None;
    }
    let payload = err.into_panic();
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Some(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::handler_fn;
    use crate::idempotency::MemoryIdempotencyStore;
    use crate::queue::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_with(handler: Arc<dyn Handler>, config: WorkerConfig) -> Worker {
        Worker::builder()
            .queue(Arc::new(InMemoryQueue::default()))
            .idempotency(Arc::new(MemoryIdempotencyStore::new()))
            .handler(handler)
            .config(config)
            .build()
    }

    #[test]
    fn test_claim_key_includes_worker_and_attempt() {
        let config = WorkerConfig {
            name: "sync".to_string(),
            ..WorkerConfig::default()
        };
        let worker = worker_with(Arc::new(handler_fn(|_m: Message| async { Ok(()) })), config);
        let message = Message::with_id("m-1", "t", json!({})).next_attempt(2);
        assert_eq!(worker.inner.claim_key(&message), "sync:m-1:2");
    }

    #[tokio::test]
    async fn test_process_success() {
        let worker = worker_with(
            Arc::new(handler_fn(|_m: Message| async { Ok(()) })),
            WorkerConfig::default(),
        );

        let disposition = worker.process(Message::new("t", json!({}))).await;

        assert_eq!(disposition, Disposition::Processed);
        assert_eq!(worker.stats().in_flight, 0);
        assert_eq!(worker.metrics().processed, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_a_failed_attempt() {
        struct Exploding;

        #[async_trait::async_trait]
        impl Handler for Exploding {
            async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
                panic!("boom");
            }
        }

        let worker = worker_with(Arc::new(Exploding), WorkerConfig::default());

        let disposition = worker.process(Message::new("t", json!({}))).await;

        assert!(matches!(disposition, Disposition::Requeued { attempts: 1, .. }));
        assert_eq!(worker.stats().in_flight, 0);
        assert_eq!(worker.stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_then_success_forgives_one_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let worker = worker_with(
            Arc::new(handler_fn(move |_m: Message| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(HandlerError::failed("first try"))
                    } else {
                        Ok(())
                    }
                }
            })),
            WorkerConfig::default(),
        );

        let message = Message::with_id("m-1", "t", json!({}));
        let first = worker.process(message.clone()).await;
        let Disposition::Requeued { attempts, delay } = first else {
            panic!("expected requeue, got {first:?}");
        };
        assert_eq!(attempts, 1);
        assert!(delay >= Duration::from_millis(2000));
        assert!(delay <= Duration::from_millis(2100));

        let second = worker.process(message.next_attempt(attempts)).await;
        assert_eq!(second, Disposition::Processed);
        assert_eq!(worker.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_panic_reason_ignores_cancellation() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let handle = tokio::spawn(std::future::pending::<()>());
            handle.abort();
            let err = handle.await.unwrap_err();
            assert!(panic_reason(err).is_none());

            let err = tokio::spawn(async { panic!("exploded") }).await.unwrap_err();
            assert_eq!(panic_reason(err).as_deref(), Some("exploded"));
        });
    }
}
