//! Message producer.
//!
//! Creates logical messages (a `pending` row plus a `message.created`
//! event) and reports a message's current status with its audit trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::bus::{BusError, MessageBroker, MESSAGE_CREATED_TOPIC};
use crate::contract::{Event, Payload};
use crate::storage::{MessageStatus, StatusStore, StorageError};

/// Source service stamped on created events.
pub const PRODUCER_SERVICE_NAME: &str = "api-gateway";

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Publish error: {0}")]
    Bus(#[from] BusError),
}

/// Identifiers of a newly created message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedMessage {
    pub id: String,
    pub correlation_id: String,
    pub idempotency_id: String,
    pub status: MessageStatus,
}

/// One history entry as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub status: MessageStatus,
    pub service: String,
    pub event_id: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Current status of a message with its transitions, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageReport {
    pub id: String,
    pub correlation_id: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

pub struct MessageProducer {
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn MessageBroker>,
    service_name: String,
}

impl MessageProducer {
    pub fn new(store: Arc<dyn StatusStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            store,
            broker,
            service_name: PRODUCER_SERVICE_NAME.to_string(),
        }
    }

    /// Record a new `pending` message and publish `message.created`.
    ///
    /// Correlation and idempotency IDs are freshly generated UUIDs.
    pub async fn create_message(
        &self,
        content: &str,
        metadata: Option<Payload>,
    ) -> Result<CreatedMessage, ProducerError> {
        if content.trim().is_empty() {
            return Err(ProducerError::InvalidRequest(
                "content must not be empty".to_string(),
            ));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let idempotency_id = Uuid::new_v4().to_string();

        info!(
            correlation_id = %correlation_id,
            idempotency_id = %idempotency_id,
            "Creating new message"
        );

        let mut payload = Payload::new();
        payload.insert("content".to_string(), json!(content));
        payload.insert(
            "metadata".to_string(),
            Value::Object(metadata.unwrap_or_default()),
        );

        self.store
            .create_or_get(&idempotency_id, &correlation_id, &payload)
            .await?;

        let event = Event::new(
            MESSAGE_CREATED_TOPIC,
            correlation_id.clone(),
            idempotency_id.clone(),
            self.service_name.clone(),
            payload,
        );
        self.broker.publish(MESSAGE_CREATED_TOPIC, &event).await?;

        info!(
            correlation_id = %correlation_id,
            idempotency_id = %idempotency_id,
            event_id = %event.event_id,
            "Message created and event published"
        );

        Ok(CreatedMessage {
            id: idempotency_id.clone(),
            correlation_id,
            idempotency_id,
            status: MessageStatus::Pending,
        })
    }

    /// Status and history of a message, or `None` if the key is unknown.
    pub async fn message_status(&self, id: &str) -> Result<Option<MessageReport>, ProducerError> {
        let Some(message) = self.store.get_message(id).await? else {
            return Ok(None);
        };

        let history = self
            .store
            .get_history(id)
            .await?
            .into_iter()
            .map(|h| StatusChange {
                status: h.status,
                service: h.service_name,
                event_id: h.event_id,
                error: h.error_message,
                timestamp: h.created_at,
            })
            .collect();

        Ok(Some(MessageReport {
            id: message.idempotency_id,
            correlation_id: message.correlation_id,
            status: message.status,
            created_at: message.created_at,
            updated_at: message.updated_at,
            history,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBroker;
    use crate::storage::MockStatusStore;

    fn producer() -> (Arc<MockStatusStore>, Arc<MockBroker>, MessageProducer) {
        let store = Arc::new(MockStatusStore::new());
        let broker = Arc::new(MockBroker::new());
        let producer = MessageProducer::new(store.clone(), broker.clone());
        (store, broker, producer)
    }

    #[tokio::test]
    async fn test_create_message_stores_and_publishes() {
        let (store, broker, producer) = producer();
        let mut metadata = Payload::new();
        metadata.insert("channel".to_string(), json!("email"));

        let created = producer
            .create_message("hello", Some(metadata))
            .await
            .unwrap();

        assert_eq!(created.id, created.idempotency_id);
        assert_eq!(created.status, MessageStatus::Pending);
        assert_ne!(created.correlation_id, created.idempotency_id);

        let message = store
            .get_message(&created.idempotency_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.payload["content"], json!("hello"));
        assert_eq!(message.payload["metadata"]["channel"], json!("email"));

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        let (topic, event) = &published[0];
        assert_eq!(topic, MESSAGE_CREATED_TOPIC);
        assert_eq!(event.event_type, MESSAGE_CREATED_TOPIC);
        assert_eq!(event.source_service, PRODUCER_SERVICE_NAME);
        assert_eq!(event.correlation_id, created.correlation_id);
        assert_eq!(event.idempotency_id, created.idempotency_id);
    }

    #[tokio::test]
    async fn test_metadata_defaults_to_empty_object() {
        let (_, broker, producer) = producer();

        producer.create_message("hello", None).await.unwrap();

        let (_, event) = broker.published().await.remove(0);
        assert_eq!(event.payload["metadata"], json!({}));
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected() {
        let (store, broker, producer) = producer();

        let err = producer.create_message("  ", None).await.unwrap_err();

        assert!(matches!(err, ProducerError::InvalidRequest(_)));
        assert_eq!(store.message_count().await, 0);
        assert_eq!(broker.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let (_, broker, producer) = producer();
        broker.set_fail_on_publish(true).await;

        let err = producer.create_message("hello", None).await.unwrap_err();

        assert!(matches!(err, ProducerError::Bus(_)));
    }

    #[tokio::test]
    async fn test_status_of_unknown_message() {
        let (_, _, producer) = producer();

        assert_eq!(producer.message_status("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_includes_history() {
        let (store, _, producer) = producer();
        let created = producer.create_message("hello", None).await.unwrap();
        store
            .update_status(
                &created.idempotency_id,
                &created.correlation_id,
                MessageStatus::Processing,
                "message-processor",
                "evt-1",
                None,
            )
            .await
            .unwrap();

        let report = producer
            .message_status(&created.id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.status, MessageStatus::Processing);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.history[0].service, "message-processor");
        assert_eq!(report.history[0].event_id, "evt-1");
        assert_eq!(report.history[0].error, None);
    }
}
