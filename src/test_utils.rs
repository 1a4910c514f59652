//! Test utilities shared by unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::RwLock;

use crate::bus::{BusError, EventHandler, Result as BusResult};
use crate::contract::{Event, Payload};
use crate::dlq::{DeadLetter, DeadLetterPublisher};

/// A valid `message.created` event for the given idempotency key.
pub fn make_event(idempotency_id: &str) -> Event {
    let payload: Payload = match json!({"content": "hello", "metadata": {}}) {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    };
    Event::new(
        "message.created",
        format!("corr-{}", idempotency_id),
        idempotency_id,
        "api-gateway",
        payload,
    )
}

/// Handler that records deliveries and fails the first `failures` attempts.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    failures: u32,
    attempts: Arc<AtomicU32>,
    handled: Arc<RwLock<Vec<Event>>>,
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler failing its first `failures` invocations.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Handler that never succeeds.
    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn handled(&self) -> Vec<Event> {
        self.handled.read().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().await.clone()
    }

    /// Wait until at least `count` events were handled successfully.
    pub async fn wait_for_handled(&self, count: usize) -> bool {
        let handled = &self.handled;
        eventually(move || async move { handled.read().await.len() >= count }).await
    }

    /// Wait until the dead-letter hook ran at least `count` times.
    pub async fn wait_for_dead_letters(&self, count: usize) -> bool {
        let dead_letters = &self.dead_letters;
        eventually(move || async move { dead_letters.read().await.len() >= count }).await
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, BusResult<()>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        let handled = Arc::clone(&self.handled);
        Box::pin(async move {
            if attempt <= failures {
                return Err(BusError::HandlerFailed(format!("attempt {} failed", attempt)));
            }
            handled.write().await.push((*event).clone());
            Ok(())
        })
    }

    fn on_dead_letter(&self, dead_letter: Arc<DeadLetter>) -> BoxFuture<'static, ()> {
        let dead_letters = Arc::clone(&self.dead_letters);
        Box::pin(async move {
            dead_letters.write().await.push((*dead_letter).clone());
        })
    }
}

/// Dead-letter sink that records what it is given.
#[derive(Default)]
pub struct RecordingDeadLetters {
    published: RwLock<Vec<(String, DeadLetter)>>,
    fail: bool,
}

impl RecordingDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose publishes always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn published(&self) -> Vec<(String, DeadLetter)> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetters {
    async fn publish_dead_letter(&self, topic: &str, dead_letter: &DeadLetter) -> BusResult<()> {
        if self.fail {
            return Err(BusError::Publish("dlq unavailable".to_string()));
        }
        self.published
            .write()
            .await
            .push((topic.to_string(), dead_letter.clone()));
        Ok(())
    }
}

/// Wait until `condition` holds, polling every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
