use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{ClaimRecord, ClaimStatus, IdempotencyStore, Result};

/// In-memory claim store
///
/// Expiry uses the tokio clock so paused-time tests can move past the TTL.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    claims: Mutex<HashMap<String, (Instant, ClaimRecord)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for `key`, if claimed and not expired
    pub async fn get(&self, key: &str) -> Option<ClaimRecord> {
        let claims = self.claims.lock().await;
        claims
            .get(key)
            .filter(|(deadline, _)| *deadline > Instant::now())
            .map(|(_, record)| record.clone())
    }

    /// Drop expired claims, returning how many were removed
    pub async fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut claims = self.claims.lock().await;
        let before = claims.len();
        claims.retain(|_, (deadline, _)| *deadline > now);
        before - claims.len()
    }

    pub async fn len(&self) -> usize {
        self.claims.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.claims.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock().await;

        if let Some((deadline, _)) = claims.get(key) {
            if *deadline > now {
                debug!(key, "Claim already held");
                return Ok(false);
            }
        }

        claims.insert(
            key.to_string(),
            (now + ttl, ClaimRecord::pending(Utc::now(), ttl)),
        );
        debug!(key, ttl_secs = ttl.as_secs(), "Claim acquired");
        Ok(true)
    }

    async fn set_result(
        &self,
        key: &str,
        status: ClaimStatus,
        meta: serde_json::Value,
    ) -> Result<()> {
        let mut claims = self.claims.lock().await;
        match claims.get_mut(key) {
            Some((_, record)) => {
                record.status = status;
                record.meta = meta;
                debug!(key, %status, "Claim result recorded");
            }
            None => debug!(key, %status, "Result for unknown claim ignored"),
        }
        Ok(())
    }
}
