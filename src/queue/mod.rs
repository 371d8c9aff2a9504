//! Queue collaborator interface
//!
//! The worker never owns queue storage. It pulls batches, then settles each
//! pulled message exactly once per attempt with either [`Queue::ack`] or
//! [`Queue::requeue`]. Pulled messages stay invisible to other consumers
//! until settled or until the queue's visibility timeout expires.

pub mod memory;

pub use memory::{InMemoryQueue, QueueStats};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("queue rejected operation: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Pull up to `max_messages`, waiting at most `wait` for the first one
    ///
    /// May return fewer messages than requested, including none.
    async fn pull(&self, max_messages: usize, wait: Duration) -> Result<Vec<Message>>;

    /// Remove a message permanently. Acking twice is not an error.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Make the message visible again after `delay`, carrying its updated `attempts`
    async fn requeue(&self, message: &Message, delay: Duration) -> Result<()>;
}
