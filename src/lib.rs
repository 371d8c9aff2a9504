pub mod config;
pub mod handlers;
pub mod humanize;
pub mod idempotency;
pub mod message;
pub mod observability;
pub mod queue;
pub mod scoring;
pub mod worker;

pub use message::Message;
pub use worker::{Worker, WorkerConfig, WorkerEvent};
