//! Message envelope exchanged between the queue, the worker and handlers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type HeadersMap = BTreeMap<String, String>;

/// One logical unit of work
///
/// While a message is in flight it is owned by exactly one processing task.
/// The worker only ever changes `attempts`, and only when requeueing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per logical unit of work
    pub id: String,
    /// Message type, used for routing (`type` on the wire)
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload, interpreted only by handlers
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: HeadersMap,
    /// Number of failed processing attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Message {
    /// Create a message with a fresh time-ordered id
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_id(Uuid::now_v7().to_string(), kind, payload)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            headers: HeadersMap::new(),
            attempts: 0,
            trace_id: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Generate a random trace id if none is set
    pub fn ensure_trace_id(mut self) -> Self {
        if self.trace_id.is_none() {
            self.trace_id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    /// Copy of this message marked for its next attempt
    pub fn next_attempt(&self, attempts: u32) -> Self {
        Self {
            attempts,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_assigns_unique_ids() {
        let a = Message::new("sync.product", json!({}));
        let b = Message::new("sync.product", json!({}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempts, 0);
        assert!(a.headers.is_empty());
    }

    #[test]
    fn test_wire_format_uses_type_and_trace_id() {
        let message = Message::with_id("m-1", "sync.order", json!({"order": 42}))
            .header("tenant", "acme")
            .trace_id("trace-1");

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "sync.order");
        assert_eq!(value["traceId"], "trace-1");
        assert_eq!(value["headers"]["tenant"], "acme");
    }

    #[test]
    fn test_deserialize_minimal_message() {
        let json = r#"{"id": "m-2", "type": "sync.user"}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.kind, "sync.user");
        assert_eq!(message.attempts, 0);
        assert!(message.payload.is_null());
        assert!(message.trace_id.is_none());
    }

    #[test]
    fn test_next_attempt_keeps_identity() {
        let message = Message::with_id("m-3", "sync.user", json!(null)).ensure_trace_id();
        let retry = message.next_attempt(2);
        assert_eq!(retry.id, message.id);
        assert_eq!(retry.trace_id, message.trace_id);
        assert_eq!(retry.attempts, 2);
    }
}
