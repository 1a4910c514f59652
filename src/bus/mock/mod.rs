//! Mock broker implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BusError, EventHandler, MessageBroker, Result};
use crate::contract::Event;
use crate::dlq::DeadLetter;

/// Mock broker for testing.
///
/// Records published events and dead letters. Subscriptions are recorded but
/// never delivered to.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<(String, Event)>>,
    dead_letters: RwLock<Vec<(String, DeadLetter)>>,
    subscriptions: RwLock<Vec<String>>,
    fail_on_publish: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Published (topic, event) pairs, oldest first.
    pub async fn published(&self) -> Vec<(String, Event)> {
        self.published.read().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<(String, DeadLetter)> {
        self.dead_letters.read().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.clone()
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn publish(&self, topic: &str, event: &Event) -> Result<()> {
        event.validate()?;
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((topic.to_string(), event.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _handler: Arc<dyn EventHandler>,
        _shutdown: CancellationToken,
    ) -> Result<()> {
        self.subscriptions.write().await.push(topic.to_string());
        Ok(())
    }

    async fn publish_to_dlq(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.dead_letters
            .write()
            .await
            .push((topic.to_string(), dead_letter.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
