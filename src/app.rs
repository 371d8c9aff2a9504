use async_trait::async_trait;
use pollwork::config::{Config, IdempotencyBackend};
use pollwork::handlers::{Handler, HandlerError, HandlerRegistry};
use pollwork::idempotency::{FjallIdempotencyStore, IdempotencyStore, MemoryIdempotencyStore};
use pollwork::message::Message;
use pollwork::queue::InMemoryQueue;
use pollwork::scoring::{PriorityScore, ScoreContext, ScoreError, Scorer};
use pollwork::worker::{Worker, WorkerEvent};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::RunArgs;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEMO_KIND: &str = "demo.task";
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub async fn run(config: Config, args: RunArgs) -> Result<(), AnyError> {
    let queue = Arc::new(InMemoryQueue::default());
    queue
        .extend((0..args.messages).map(|sequence| {
            Message::new(
                DEMO_KIND,
                serde_json::json!({ "sequence": sequence, "priority": sequence % 3 }),
            )
            .ensure_trace_id()
        }))
        .await;

    let (idempotency, durable) = open_idempotency(&config)?;

    let mut registry = HandlerRegistry::new();
    registry.register(
        DEMO_KIND,
        Arc::new(SimulatedHandler::new(
            Duration::from_millis(args.latency),
            args.fail_every,
        )),
    )?;

    let scorer = args
        .prioritize
        .then(|| Arc::new(PayloadPriorityScorer) as Arc<dyn Scorer>);

    let worker = Worker::builder()
        .queue(queue.clone())
        .idempotency(idempotency)
        .handler(Arc::new(registry))
        .maybe_scorer(scorer)
        .config(config.worker.clone())
        .build();

    let event_logger = spawn_event_logger(worker.subscribe());

    info!(
        worker = %worker.name(),
        messages = args.messages,
        fail_every = args.fail_every,
        latency_ms = args.latency,
        "Starting demo run"
    );
    worker.start();

    tokio::select! {
        _ = shutdown_signal() => {},
        _ = wait_until_settled(&worker, &queue, args.until_idle) => {},
    }

    let report = worker.stop(config.worker.shutdown_grace).await;
    let metrics = worker.metrics();
    let queue_stats = queue.stats().await;
    info!(
        drained = report.drained,
        in_flight = report.in_flight,
        processed = metrics.processed,
        duplicates = metrics.duplicates,
        requeued = metrics.requeued,
        dead_lettered = metrics.dead_lettered,
        outstanding = queue_stats.outstanding(),
        "Demo run finished"
    );

    if let Some(store) = durable {
        let stats = store.prune_expired()?;
        debug!(scanned = stats.scanned, pruned = stats.pruned, "Pruned idempotency claims");
        store.persist()?;
    }

    event_logger.abort();
    Ok(())
}

pub fn print_config(config: &Config) -> Result<(), AnyError> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn open_idempotency(
    config: &Config,
) -> Result<(Arc<dyn IdempotencyStore>, Option<Arc<FjallIdempotencyStore>>), AnyError> {
    match config.idempotency.backend {
        IdempotencyBackend::Memory => {
            let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
            Ok((store, None))
        }
        IdempotencyBackend::Fjall => {
            let store = Arc::new(FjallIdempotencyStore::open(&config.idempotency.path)?);
            info!(path = %config.idempotency.path.display(), "Opened durable idempotency store");
            let shared: Arc<dyn IdempotencyStore> = store.clone();
            Ok((shared, Some(store)))
        }
    }
}

/// Resolve once the worker stopped on its own, or, with `until_idle`, once
/// every message has been settled.
async fn wait_until_settled(worker: &Worker, queue: &InMemoryQueue, until_idle: bool) {
    loop {
        tokio::time::sleep(IDLE_CHECK_INTERVAL).await;

        if !worker.is_running() {
            warn!("Worker is no longer running");
            return;
        }

        if until_idle && worker.stats().in_flight == 0 && queue.stats().await.outstanding() == 0 {
            info!("Queue drained");
            return;
        }
    }
}

fn spawn_event_logger(mut events: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::DeadLetter(dead)) => warn!(
                    message_id = %dead.message.id,
                    attempts = dead.attempts,
                    error = %dead.error,
                    failed_at = %dead.failed_at,
                    "Dead letter"
                ),
                Ok(WorkerEvent::Fatal { error }) => error!(error = %error, "Worker crashed"),
                Ok(event) => debug!(event = event.name(), "Worker event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[derive(Debug, Deserialize)]
struct DemoPayload {
    sequence: u64,
}

/// Sleeps for a fixed latency and fails every `fail_every`-th call
struct SimulatedHandler {
    latency: Duration,
    fail_every: u64,
    calls: AtomicU64,
}

impl SimulatedHandler {
    fn new(latency: Duration, fail_every: u64) -> Self {
        Self {
            latency,
            fail_every,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Handler for SimulatedHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let payload: DemoPayload = serde_json::from_value(message.payload.clone())?;
        tokio::time::sleep(self.latency).await;

        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(HandlerError::failed(format!(
                "simulated failure on call {call} (sequence {})",
                payload.sequence
            )));
        }

        debug!(
            message_id = %message.id,
            sequence = payload.sequence,
            attempts = message.attempts,
            "Handled demo message"
        );
        Ok(())
    }
}

/// Ranks messages by their numeric payload `priority`
struct PayloadPriorityScorer;

#[async_trait]
impl Scorer for PayloadPriorityScorer {
    async fn score(
        &self,
        messages: &[Message],
        _ctx: &ScoreContext,
    ) -> Result<Vec<PriorityScore>, ScoreError> {
        Ok(messages
            .iter()
            .map(|message| {
                let priority = message
                    .payload
                    .get("priority")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                PriorityScore::new(message.id.clone(), priority)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_simulated_handler_fails_every_kth_call() {
        let handler = SimulatedHandler::new(Duration::ZERO, 2);
        let message = Message::new(DEMO_KIND, json!({ "sequence": 1 }));

        assert!(handler.handle(&message).await.is_ok());
        assert!(matches!(
            handler.handle(&message).await,
            Err(HandlerError::Failed(_))
        ));
        assert!(handler.handle(&message).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_handler_rejects_bad_payload() {
        let handler = SimulatedHandler::new(Duration::ZERO, 0);
        let message = Message::new(DEMO_KIND, json!({ "unexpected": true }));
        assert!(matches!(
            handler.handle(&message).await,
            Err(HandlerError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_scorer_reads_priority() {
        let messages = vec![
            Message::with_id("low", DEMO_KIND, json!({ "priority": 1 })),
            Message::with_id("none", DEMO_KIND, json!({})),
        ];
        let ctx = ScoreContext {
            worker: "demo".to_string(),
            in_flight: 0,
            max_concurrent: 1,
        };
        let scores = PayloadPriorityScorer.score(&messages, &ctx).await.unwrap();
        assert_eq!(scores[0], PriorityScore::new("low", 1.0));
        assert_eq!(scores[1], PriorityScore::new("none", 0.0));
    }
}
