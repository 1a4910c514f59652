//! Dead Letter Queue (DLQ) records.
//!
//! A [`DeadLetter`] is built when an event leaves the normal delivery path
//! and is published to the conventionally named `<topic>.dlq` destination.
//!
//! ## Message Format
//!
//! JSON object with the fields `original_event`, `error`, `retry_count` and
//! `last_attempt` (RFC3339).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::Result;
use crate::contract::{now_rfc3339, Event};

/// Suffix appended to a topic or queue name to form its DLQ name.
pub const DLQ_SUFFIX: &str = ".dlq";

/// Build the DLQ name for a topic or queue.
pub fn dlq_topic(topic: &str) -> String {
    format!("{}{}", topic, DLQ_SUFFIX)
}

/// Failure record for an event that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The event as it was received.
    pub original_event: Event,
    /// Human-readable description of the last failure.
    pub error: String,
    /// Number of handler attempts made before giving up.
    pub retry_count: u32,
    /// When the last attempt finished (RFC3339).
    pub last_attempt: String,
}

impl DeadLetter {
    /// Create a dead letter stamped with the current time.
    pub fn new(original_event: Event, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            original_event,
            error: error.into(),
            retry_count,
            last_attempt: now_rfc3339(),
        }
    }

    /// Dead letter for an event that failed contract validation.
    ///
    /// No handler attempt is made for such events.
    pub fn rejected(original_event: Event, error: impl Into<String>) -> Self {
        Self::new(original_event, error, 0)
    }

    pub fn correlation_id(&self) -> &str {
        &self.original_event.correlation_id
    }

    pub fn idempotency_id(&self) -> &str {
        &self.original_event.idempotency_id
    }

    /// Serialize to JSON for publishing.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Destination for dead letters produced by the delivery policy.
///
/// Every broker implements this by publishing to `<topic>.dlq` on its own
/// transport.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish_dead_letter(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> Event {
        Event::new(
            "message.created",
            "corr-1",
            "idem-1",
            "api-gateway",
            Default::default(),
        )
    }

    #[test]
    fn test_dlq_topic() {
        assert_eq!(dlq_topic("message.created"), "message.created.dlq");
        assert_eq!(
            dlq_topic("message.status.updated"),
            "message.status.updated.dlq"
        );
    }

    #[test]
    fn test_new_dead_letter() {
        let dl = DeadLetter::new(make_event(), "store unavailable", 3);

        assert_eq!(dl.retry_count, 3);
        assert_eq!(dl.error, "store unavailable");
        assert_eq!(dl.correlation_id(), "corr-1");
        assert_eq!(dl.idempotency_id(), "idem-1");
        assert!(chrono::DateTime::parse_from_rfc3339(&dl.last_attempt).is_ok());
    }

    #[test]
    fn test_rejected_has_no_attempts() {
        let dl = DeadLetter::rejected(make_event(), "event_id is required");
        assert_eq!(dl.retry_count, 0);
    }

    #[test]
    fn test_wire_format() {
        let dl = DeadLetter::new(make_event(), "boom", 2);
        let value: serde_json::Value = serde_json::from_slice(&dl.to_json().unwrap()).unwrap();

        assert_eq!(value["error"], "boom");
        assert_eq!(value["retry_count"], 2);
        assert_eq!(value["original_event"]["idempotency_id"], "idem-1");
        assert!(value["last_attempt"].is_string());

        let decoded = DeadLetter::from_json(&dl.to_json().unwrap()).unwrap();
        assert_eq!(decoded, dl);
    }
}
