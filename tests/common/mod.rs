//! Helpers shared by the broker integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use msgflow::bus::{BusError, EventHandler};
use msgflow::contract::{Event, Payload};
use msgflow::dlq::DeadLetter;
use serde_json::json;
use tokio::sync::mpsc;

/// Build a valid `message.created` event with unique identifiers.
pub fn make_event() -> Event {
    let id = uuid::Uuid::new_v4().to_string();
    let mut payload = Payload::new();
    payload.insert("content".to_string(), json!("hello"));
    Event::new(
        "message.created",
        format!("corr-{}", id),
        id,
        "api-gateway",
        payload,
    )
}

/// Unique topic/queue name so tests never share state.
pub fn unique_topic(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Forwards handled events and dead letters to channels.
///
/// Fails the first `failures` attempts of every delivery.
pub struct ForwardingHandler {
    failures: u32,
    attempts: Arc<AtomicU32>,
    events: mpsc::UnboundedSender<Event>,
    dead_letters: mpsc::UnboundedSender<DeadLetter>,
}

pub struct Received {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
    pub attempts: Arc<AtomicU32>,
}

impl ForwardingHandler {
    pub fn new() -> (Arc<Self>, Received) {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> (Arc<Self>, Received) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (dead_tx, dead_letters) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(Self {
            failures,
            attempts: attempts.clone(),
            events: events_tx,
            dead_letters: dead_tx,
        });
        (
            handler,
            Received {
                events,
                dead_letters,
                attempts,
            },
        )
    }
}

impl EventHandler for ForwardingHandler {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), BusError>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        let events = self.events.clone();
        Box::pin(async move {
            if attempt <= failures {
                return Err(BusError::HandlerFailed(format!("attempt {} failed", attempt)));
            }
            let _ = events.send((*event).clone());
            Ok(())
        })
    }

    fn on_dead_letter(&self, dead_letter: Arc<DeadLetter>) -> BoxFuture<'static, ()> {
        let dead_letters = self.dead_letters.clone();
        Box::pin(async move {
            let _ = dead_letters.send((*dead_letter).clone());
        })
    }
}

/// Receive the next item or panic after `timeout`.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, timeout: Duration) -> T {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}
