//! Idempotency claims
//!
//! A claim is an exclusive, TTL-bounded reservation of a deduplication key.
//! The first `acquire` for a key wins; every later `acquire` inside the TTL
//! window loses, no matter what result was recorded for the key. Results are
//! informational only and never release a claim.
//!
//! Two stores ship with the crate:
//!
//! - [`MemoryIdempotencyStore`] - process-local, for tests and single-node demos
//! - [`FjallIdempotencyStore`] - durable, backed by a Fjall keyspace

pub mod memory;
pub mod store;

pub use memory::MemoryIdempotencyStore;
pub use store::{FjallIdempotencyStore, PruneStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Outcome recorded against a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Claimed, handler not settled yet
    Pending,
    Success,
    Failed,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Success => "success",
            ClaimStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Stored state of one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub status: ClaimStatus,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn pending(now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            status: ClaimStatus::Pending,
            meta: serde_json::Value::Null,
            claimed_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim `key` for `ttl`. Returns `true` only for the first claim in the window.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Record the outcome for an existing claim
    async fn set_result(&self, key: &str, status: ClaimStatus, meta: serde_json::Value)
        -> Result<()>;
}
