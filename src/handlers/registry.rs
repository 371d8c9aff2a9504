use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::traits::{Handler, HandlerError};
use crate::message::Message;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler not found: {0}")]
    NotFound(String),
    #[error("duplicate handler for message type: {0}")]
    Duplicate(String),
}

/// Registry mapping message types to handler instances
///
/// The registry is itself a [`Handler`]: it routes each message by its
/// `type` and fails with [`HandlerError::UnknownType`] when nothing matches
/// and no fallback is set.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Handler used for message types with no explicit registration
    pub fn with_fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Handler>, RegistryError> {
        self.handlers
            .get(kind)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(kind.to_string()))
    }

    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[async_trait]
impl Handler for HandlerRegistry {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let handler = self
            .get(&message.kind)
            .map_err(|_| HandlerError::UnknownType(message.kind.clone()))?;
        debug!(message_id = %message.id, kind = %message.kind, "Routing message");
        handler.handle(message).await
    }
}
