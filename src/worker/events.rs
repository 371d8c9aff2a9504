//! Lifecycle events fanned out to subscribers

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::message::Message;

/// Events buffered per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A message that exhausted its attempts
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as it was last delivered
    pub message: Message,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Handler succeeded and the message was acked
    Processed(Message),
    /// Claim already held: acked without running the handler
    Duplicate(Message),
    /// Handler failed; the message carries its new attempt count
    Requeued { message: Message, delay: Duration },
    DeadLetter(DeadLetter),
    CircuitOpened { consecutive_failures: u32 },
    CircuitHalfOpen,
    CircuitClosed,
    /// The poll loop crashed and is no longer running
    Fatal { error: String },
    /// `stop` returned; `in_flight` tasks were still running at that point
    Stopped { in_flight: usize },
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Processed(_) => "processed",
            WorkerEvent::Duplicate(_) => "duplicate",
            WorkerEvent::Requeued { .. } => "requeued",
            WorkerEvent::DeadLetter(_) => "dead-letter",
            WorkerEvent::CircuitOpened { .. } => "circuit-opened",
            WorkerEvent::CircuitHalfOpen => "circuit-half-open",
            WorkerEvent::CircuitClosed => "circuit-closed",
            WorkerEvent::Fatal { .. } => "fatal",
            WorkerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Broadcast fan-out of [`WorkerEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(WorkerEvent::CircuitHalfOpen);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(WorkerEvent::Processed(Message::with_id("a", "t", json!({}))));

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                WorkerEvent::Processed(message) => assert_eq!(message.id, "a"),
                other => panic!("unexpected event: {}", other.name()),
            }
        }
    }
}
