use async_trait::async_trait;
use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::{ClaimRecord, ClaimStatus, IdempotencyStore, Result};

/// Key layout:
/// - `claims`: claim:{key} -> ClaimRecord (JSON)
/// - `metadata`: meta:{key} -> value (string)
fn encode_claim_key(key: &str) -> Vec<u8> {
    format!("claim:{}", key).into_bytes()
}

fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

const META_LAST_PRUNE: &str = "last_prune";

/// Pruning statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub scanned: usize,
    pub pruned: usize,
}

/// Fjall-backed durable claim store
///
/// Claims and results are flushed to the OS on every write, so they survive
/// a process crash and redelivered messages are still deduplicated after a
/// restart. Surviving power loss needs [`persist`](Self::persist), which
/// fsyncs. Expiry is wall-clock based.
pub struct FjallIdempotencyStore {
    keyspace: Keyspace,
    claims: PartitionHandle,
    metadata: PartitionHandle,
    // Serializes read-check-write in acquire
    claim_lock: Mutex<()>,
}

impl FjallIdempotencyStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening idempotency store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let claims = keyspace.open_partition("claims", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            claims,
            metadata,
            claim_lock: Mutex::new(()),
        })
    }

    /// Current record for `key`, if claimed and not expired
    pub fn get(&self, key: &str) -> Result<Option<ClaimRecord>> {
        match self.claims.get(encode_claim_key(key))? {
            Some(bytes) => {
                let record: ClaimRecord = serde_json::from_slice(&bytes)?;
                Ok((!record.is_expired(Utc::now())).then_some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove expired claims
    pub fn prune_expired(&self) -> Result<PruneStats> {
        let now = Utc::now();
        let mut stats = PruneStats::default();

        for item in self.claims.iter() {
            let (key, value) = item?;
            stats.scanned += 1;

            let expired = serde_json::from_slice::<ClaimRecord>(&value)
                .map(|record| record.is_expired(now))
                // Unreadable records can never be matched again
                .unwrap_or(true);

            if expired {
                self.claims.remove(key)?;
                stats.pruned += 1;
            }
        }

        self.metadata.insert(
            encode_meta_key(META_LAST_PRUNE),
            now.timestamp_millis().to_string().as_bytes(),
        )?;
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;

        info!(scanned = stats.scanned, pruned = stats.pruned, "Pruned idempotency claims");
        Ok(stats)
    }

    /// Unix millis of the last completed prune
    pub fn last_prune_ms(&self) -> Result<Option<i64>> {
        let value = self.metadata.get(encode_meta_key(META_LAST_PRUNE))?;
        Ok(value
            .and_then(|bytes| std::str::from_utf8(&bytes).ok().map(str::to_owned))
            .and_then(|s| s.parse().ok()))
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.claim_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let claim_key = encode_claim_key(key);

        if let Some(bytes) = self.claims.get(&claim_key)? {
            let existing: ClaimRecord = serde_json::from_slice(&bytes)?;
            if !existing.is_expired(now) {
                debug!(key, "Claim already held");
                return Ok(false);
            }
        }

        let record = ClaimRecord::pending(now, ttl);
        self.claims.insert(claim_key, serde_json::to_vec(&record)?)?;
        self.keyspace.persist(fjall::PersistMode::Buffer)?;
        debug!(key, ttl_secs = ttl.as_secs(), "Claim acquired");
        Ok(true)
    }

    fn write_result(&self, key: &str, status: ClaimStatus, meta: serde_json::Value) -> Result<()> {
        let _guard = self.claim_lock.lock().unwrap_or_else(|e| e.into_inner());
        let claim_key = encode_claim_key(key);

        let Some(bytes) = self.claims.get(&claim_key)? else {
            debug!(key, %status, "Result for unknown claim ignored");
            return Ok(());
        };

        let mut record: ClaimRecord = serde_json::from_slice(&bytes)?;
        record.status = status;
        record.meta = meta;
        self.claims.insert(claim_key, serde_json::to_vec(&record)?)?;
        self.keyspace.persist(fjall::PersistMode::Buffer)?;
        debug!(key, %status, "Claim result recorded");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for FjallIdempotencyStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.try_claim(key, ttl)
    }

    async fn set_result(
        &self,
        key: &str,
        status: ClaimStatus,
        meta: serde_json::Value,
    ) -> Result<()> {
        self.write_result(key, status, meta)
    }
}
