//! Shared fixtures for worker integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use pollwork::handlers::Handler;
use pollwork::idempotency::MemoryIdempotencyStore;
use pollwork::message::Message;
use pollwork::queue::{InMemoryQueue, Queue, QueueError};
use pollwork::worker::{Worker, WorkerConfig, WorkerEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio::time::{Instant, timeout};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// In-memory queue that records every call and can inject failures
#[derive(Default)]
pub struct RecordingQueue {
    inner: InMemoryQueue,
    pulls: Mutex<Vec<Instant>>,
    acks: Mutex<Vec<Message>>,
    requeues: Mutex<Vec<(Message, Duration)>>,
    pub fail_pulls: AtomicBool,
    pub fail_acks: AtomicBool,
    pub panic_on_pull: AtomicBool,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, message: Message) {
        self.inner.push(message).await;
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.lock().unwrap().len()
    }

    pub fn pull_times(&self) -> Vec<Instant> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<Message> {
        self.acks.lock().unwrap().clone()
    }

    pub fn requeues(&self) -> Vec<(Message, Duration)> {
        self.requeues.lock().unwrap().clone()
    }

    pub async fn outstanding(&self) -> usize {
        self.inner.stats().await.outstanding()
    }
}

#[async_trait]
impl Queue for RecordingQueue {
    async fn pull(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.pulls.lock().unwrap().push(Instant::now());
        if self.panic_on_pull.load(Ordering::SeqCst) {
            panic!("queue exploded");
        }
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker down".to_string()));
        }
        self.inner.pull(max_messages, wait).await
    }

    async fn ack(&self, message: &Message) -> Result<(), QueueError> {
        self.acks.lock().unwrap().push(message.clone());
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("ack lost".to_string()));
        }
        self.inner.ack(message).await
    }

    async fn requeue(&self, message: &Message, delay: Duration) -> Result<(), QueueError> {
        self.requeues
            .lock()
            .unwrap()
            .push((message.clone(), delay));
        self.inner.requeue(message, delay).await
    }
}

/// Test context holding the worker and its collaborators
pub struct TestContext {
    pub queue: Arc<RecordingQueue>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub worker: Worker,
    pub events: Receiver<WorkerEvent>,
}

impl TestContext {
    pub fn new(handler: Arc<dyn Handler>, config: WorkerConfig) -> Self {
        let queue = Arc::new(RecordingQueue::new());
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let worker = Worker::builder()
            .queue(queue.clone())
            .idempotency(idempotency.clone())
            .handler(handler)
            .config(config)
            .build();
        let events = worker.subscribe();

        Self {
            queue,
            idempotency,
            worker,
            events,
        }
    }

    /// Wait for the next event matching `pred`, skipping others
    pub async fn next_event<F>(&mut self, pred: F) -> WorkerEvent
    where
        F: Fn(&WorkerEvent) -> bool,
    {
        next_event(&mut self.events, pred).await
    }

    /// Collect `count` events matching `pred`
    pub async fn collect<F>(&mut self, count: usize, pred: F) -> Vec<WorkerEvent>
    where
        F: Fn(&WorkerEvent) -> bool,
    {
        let mut seen = Vec::with_capacity(count);
        while seen.len() < count {
            seen.push(self.next_event(&pred).await);
        }
        seen
    }
}

pub async fn next_event<F>(events: &mut Receiver<WorkerEvent>, pred: F) -> WorkerEvent
where
    F: Fn(&WorkerEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Poll `cond` every millisecond until it holds
pub async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Short intervals so paused-time tests settle quickly
pub fn fast_config() -> WorkerConfig {
    WorkerConfig {
        name: "test-worker".to_string(),
        poll_interval: Duration::from_millis(10),
        requeue_delay_base: Duration::from_millis(20),
        circuit_reset: Duration::from_secs(1),
        ..WorkerConfig::default()
    }
}

pub fn is_processed(event: &WorkerEvent) -> bool {
    matches!(event, WorkerEvent::Processed(_))
}

pub fn is_dead_letter(event: &WorkerEvent) -> bool {
    matches!(event, WorkerEvent::DeadLetter(_))
}

/// Tracks current and peak concurrency of a handler
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
