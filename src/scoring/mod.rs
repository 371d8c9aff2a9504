//! Optional batch prioritization
//!
//! A [`Scorer`] assigns a priority to each message of a pulled batch; the
//! worker dispatches higher priorities first. Scoring is best-effort: any
//! scoring error leaves the batch in pull (FIFO) order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    #[error("scoring failed: {0}")]
    Failed(String),
    #[error("scorer panicked: {0}")]
    Panicked(String),
}

/// Priority assigned to one message id
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityScore {
    pub id: String,
    pub priority: f64,
}

impl PriorityScore {
    pub fn new(id: impl Into<String>, priority: f64) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

/// Worker state handed to the scorer alongside the batch
#[derive(Debug, Clone)]
pub struct ScoreContext {
    pub worker: String,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        messages: &[Message],
        ctx: &ScoreContext,
    ) -> Result<Vec<PriorityScore>, ScoreError>;
}

/// Stable sort by descending priority. Unscored messages rank as 0.
pub fn order_by_priority(mut batch: Vec<Message>, scores: &[PriorityScore]) -> Vec<Message> {
    let by_id: HashMap<&str, f64> = scores
        .iter()
        .map(|score| (score.id.as_str(), score.priority))
        .collect();

    let priority = |message: &Message| by_id.get(message.id.as_str()).copied().unwrap_or(0.0);
    batch.sort_by(|a, b| priority(b).total_cmp(&priority(a)));
    batch
}

/// Score and reorder a batch, falling back to FIFO order on scoring errors
///
/// The scorer runs in its own task, so a panicking scorer is reported as
/// [`ScoreError::Panicked`] and the batch keeps its pull order.
pub async fn prioritize(
    scorer: Option<&Arc<dyn Scorer>>,
    batch: Vec<Message>,
    ctx: &ScoreContext,
) -> Vec<Message> {
    let Some(scorer) = scorer else {
        return batch;
    };

    if batch.len() < 2 {
        return batch;
    }

    match score_isolated(Arc::clone(scorer), &batch, ctx).await {
        Ok(scores) => order_by_priority(batch, &scores),
        Err(err) => {
            warn!(
                worker = %ctx.worker,
                batch_size = batch.len(),
                error = %err,
                "Scoring failed, processing batch in FIFO order"
            );
            batch
        }
    }
}

async fn score_isolated(
    scorer: Arc<dyn Scorer>,
    batch: &[Message],
    ctx: &ScoreContext,
) -> Result<Vec<PriorityScore>, ScoreError> {
    let messages = batch.to_vec();
    let ctx = ctx.clone();

    match tokio::spawn(async move { scorer.score(&messages, &ctx).await }).await {
        Ok(result) => result,
        Err(err) => Err(ScoreError::Panicked(err.to_string())),
    }
}
