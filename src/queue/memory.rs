use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Queue, Result};
use crate::message::Message;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-local queue with visibility-timeout semantics
///
/// Layout:
/// - `ready`: visible messages in FIFO order
/// - `delayed`: requeued messages with the instant they become visible
/// - `leased`: pulled messages keyed by id, with their visibility deadline
///
/// A leased message that is neither acked nor requeued before its deadline
/// goes back to `ready` on the next pull. Nothing is persisted.
pub struct InMemoryQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    leased: HashMap<String, (Instant, Message)>,
    acked: u64,
}

impl QueueState {
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, message)| {
            if *at <= now {
                due.push((*at, message.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, message)| message));

        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some((_, message)) = self.leased.remove(&id) {
                debug!(message_id = %id, "Visibility timeout expired, message visible again");
                self.ready.push_back(message);
            }
        }
    }

    fn take(&mut self, max_messages: usize, now: Instant, visibility: Duration) -> Vec<Message> {
        let count = max_messages.min(self.ready.len());
        let batch: Vec<Message> = self.ready.drain(..count).collect();
        for message in &batch {
            self.leased
                .insert(message.id.clone(), (now + visibility, message.clone()));
        }
        batch
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
    pub acked: u64,
}

impl QueueStats {
    /// Messages not yet acked, visible or not
    pub fn outstanding(&self) -> usize {
        self.ready + self.delayed + self.leased
    }
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub async fn push(&self, message: Message) {
        debug!(message_id = %message.id, kind = %message.kind, "Message enqueued");
        self.inner.lock().await.ready.push_back(message);
        self.notify.notify_one();
    }

    pub async fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.inner.lock().await;
        state.ready.extend(messages);
        drop(state);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.lock().await;
        QueueStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            leased: state.leased.len(),
            acked: state.acked,
        }
    }

    async fn try_take(&self, max_messages: usize) -> Vec<Message> {
        let now = Instant::now();
        let mut state = self.inner.lock().await;
        state.promote(now);
        state.take(max_messages, now, self.visibility_timeout)
    }

    async fn next_due(&self) -> Option<Instant> {
        let state = self.inner.lock().await;
        let delayed = state.delayed.iter().map(|(at, _)| *at);
        let leased = state.leased.values().map(|(deadline, _)| *deadline);
        delayed.chain(leased).min()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn pull(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let batch = self.try_take(max_messages).await;
            if !batch.is_empty() {
                debug!(count = batch.len(), "Pulled batch");
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            // Wake on push, on the next delayed message becoming due, or at the deadline
            let wake_at = self
                .next_due()
                .await
                .map_or(deadline, |due| due.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.leased.remove(&message.id).is_some() {
            state.acked += 1;
            debug!(message_id = %message.id, "Message acked");
        }
        Ok(())
    }

    async fn requeue(&self, message: &Message, delay: Duration) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.leased.remove(&message.id);
        state
            .delayed
            .push((Instant::now() + delay, message.clone()));
        drop(state);
        debug!(
            message_id = %message.id,
            attempts = message.attempts,
            delay_ms = delay.as_millis() as u64,
            "Message requeued"
        );
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str) -> Message {
        Message::with_id(id, "test", json!({}))
    }

    #[tokio::test]
    async fn test_pull_respects_max_messages() {
        let queue = InMemoryQueue::default();
        queue.extend(["a", "b", "c"].map(message)).await;

        let batch = queue.pull(2, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "a");
        assert_eq!(batch[1].id, "b");

        let stats = queue.stats().await;
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.leased, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_empty_waits_for_hint() {
        let queue = InMemoryQueue::default();
        let started = Instant::now();

        let batch = queue.pull(5, Duration::from_millis(200)).await.unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let queue = InMemoryQueue::default();
        queue.push(message("a")).await;

        let batch = queue.pull(1, Duration::ZERO).await.unwrap();
        queue.ack(&batch[0]).await.unwrap();
        queue.ack(&batch[0]).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delays_visibility() {
        let queue = InMemoryQueue::default();
        queue.push(message("a")).await;

        let batch = queue.pull(1, Duration::ZERO).await.unwrap();
        let retry = batch[0].next_attempt(1);
        queue.requeue(&retry, Duration::from_secs(2)).await.unwrap();

        assert!(queue.pull(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let batch = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new(Duration::from_secs(5));
        queue.push(message("a")).await;

        let first = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.pull(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(again[0].id, "a");
    }
}
