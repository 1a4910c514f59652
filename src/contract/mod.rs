//! Event contract shared by every producer and consumer.
//!
//! The JSON shape of [`Event`] is the wire format:
//!
//! ```json
//! {
//!   "event_id": "9f1c…",
//!   "correlation_id": "…",
//!   "idempotency_id": "…",
//!   "event_type": "message.created",
//!   "source_service": "api-gateway",
//!   "timestamp": "2024-05-01T10:00:00Z",
//!   "payload": { "content": "hello" }
//! }
//! ```
//!
//! Field names, RFC3339 second-precision timestamps and hex-encoded 128-bit
//! event IDs must stay byte-compatible with existing producers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Opaque event payload.
pub type Payload = Map<String, Value>;

/// Errors raised by [`Event::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("event_id is required")]
    MissingEventId,

    #[error("correlation_id is required")]
    MissingCorrelationId,

    #[error("idempotency_id is required")]
    MissingIdempotencyId,

    #[error("event_type is required")]
    MissingEventType,

    #[error("source_service is required")]
    MissingSourceService,

    #[error("timestamp is required")]
    MissingTimestamp,
}

impl ContractError {
    /// Name of the wire field this error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ContractError::MissingEventId => "event_id",
            ContractError::MissingCorrelationId => "correlation_id",
            ContractError::MissingIdempotencyId => "idempotency_id",
            ContractError::MissingEventType => "event_type",
            ContractError::MissingSourceService => "source_service",
            ContractError::MissingTimestamp => "timestamp",
        }
    }
}

/// Standard event envelope used across all services.
///
/// Absent or `null` fields decode as empty, so [`Event::validate`] can name
/// the missing field instead of the decoder rejecting the whole message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub correlation_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub idempotency_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source_service: String,
    /// RFC3339 UTC timestamp.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Event {
    /// Create a new event, generating `event_id` and `timestamp`.
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: impl Into<String>,
        idempotency_id: impl Into<String>,
        source_service: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            correlation_id: correlation_id.into(),
            idempotency_id: idempotency_id.into(),
            event_type: event_type.into(),
            source_service: source_service.into(),
            timestamp: now_rfc3339(),
            payload,
        }
    }

    /// Check that every required field is present.
    ///
    /// Reports the first missing field in wire order.
    pub fn validate(&self) -> Result<(), ContractError> {
        let checks = [
            (&self.event_id, ContractError::MissingEventId),
            (&self.correlation_id, ContractError::MissingCorrelationId),
            (&self.idempotency_id, ContractError::MissingIdempotencyId),
            (&self.event_type, ContractError::MissingEventType),
            (&self.source_service, ContractError::MissingSourceService),
            (&self.timestamp, ContractError::MissingTimestamp),
        ];

        for (value, error) in checks {
            if value.is_empty() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from the JSON wire format.
    ///
    /// Decoding does not validate; call [`Event::validate`] on the result.
    /// Only malformed JSON or wrongly typed fields fail here.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// String value of a payload field, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Current UTC time as RFC3339 with second precision (`2024-05-01T10:00:00Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 128 random bits, hex-encoded.
fn generate_event_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
