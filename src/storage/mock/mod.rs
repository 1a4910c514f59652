//! Mock storage implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    CreateOrGet, Message, MessageHistory, MessageStatus, Result, StatusStore, StorageError,
};
use crate::contract::Payload;

#[derive(Default)]
struct State {
    messages: HashMap<String, Message>,
    history: Vec<MessageHistory>,
}

/// In-memory status store with failure injection.
#[derive(Default)]
pub struct MockStatusStore {
    state: RwLock<State>,
    fail_on_create: RwLock<bool>,
    fail_on_status: RwLock<Option<MessageStatus>>,
}

impl MockStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_create(&self, fail: bool) {
        *self.fail_on_create.write().await = fail;
    }

    /// Fail every `update_status` call that targets `status`.
    pub async fn set_fail_on_status(&self, status: Option<MessageStatus>) {
        *self.fail_on_status.write().await = status;
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

#[async_trait]
impl StatusStore for MockStatusStore {
    async fn create_or_get(
        &self,
        idempotency_id: &str,
        correlation_id: &str,
        payload: &Payload,
    ) -> Result<CreateOrGet> {
        if *self.fail_on_create.read().await {
            return Err(StorageError::Injected("create_or_get".to_string()));
        }

        let mut state = self.state.write().await;
        let now = Utc::now();

        if let Some(message) = state.messages.get_mut(idempotency_id) {
            message.updated_at = now;
            return Ok(CreateOrGet {
                message: message.clone(),
                existed: true,
            });
        }

        let message = Message {
            idempotency_id: idempotency_id.to_string(),
            correlation_id: correlation_id.to_string(),
            status: MessageStatus::Pending,
            payload: serde_json::Value::Object(payload.clone()),
            created_at: now,
            updated_at: now,
        };
        state
            .messages
            .insert(idempotency_id.to_string(), message.clone());

        Ok(CreateOrGet {
            message,
            existed: false,
        })
    }

    async fn update_status(
        &self,
        idempotency_id: &str,
        correlation_id: &str,
        status: MessageStatus,
        service_name: &str,
        event_id: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        if *self.fail_on_status.read().await == Some(status) {
            return Err(StorageError::Injected(format!("update_status({})", status)));
        }

        let mut state = self.state.write().await;
        let now = Utc::now();

        let message = state
            .messages
            .get_mut(idempotency_id)
            .ok_or_else(|| StorageError::NotFound(idempotency_id.to_string()))?;
        message.status = status;
        message.updated_at = now;

        let id = state.history.len() as i64 + 1;
        state.history.push(MessageHistory {
            id,
            idempotency_id: idempotency_id.to_string(),
            correlation_id: correlation_id.to_string(),
            status,
            service_name: service_name.to_string(),
            event_id: event_id.to_string(),
            error_message: error_message.map(str::to_string),
            created_at: now,
        });
        Ok(())
    }

    async fn get_message(&self, idempotency_id: &str) -> Result<Option<Message>> {
        Ok(self.state.read().await.messages.get(idempotency_id).cloned())
    }

    async fn get_history(&self, idempotency_id: &str) -> Result<Vec<MessageHistory>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .iter()
            .filter(|h| h.idempotency_id == idempotency_id)
            .cloned()
            .collect())
    }
}
