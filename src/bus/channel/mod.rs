//! In-memory channel-based broker for standalone mode.
//!
//! Uses one tokio broadcast channel per topic for pub/sub within a single
//! process. Events travel as JSON bytes, so subscribers see exactly what a
//! network broker would deliver.
//!
//! Publishers and subscribers must share one broker instance, so this mode
//! serves tests and embedded single-process pipelines. A broker built with
//! [`ChannelBroker::recording`] also keeps every published payload for
//! inspection; the default broker keeps nothing after fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::dispatch::{self, DeliveryPolicy};
use super::{BusError, EventHandler, MessageBroker, Result};
use crate::contract::Event;
use crate::dlq::{dlq_topic, DeadLetter, DeadLetterPublisher};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

type Payload = Arc<Vec<u8>>;

/// In-memory broker using tokio broadcast channels.
///
/// Every subscriber of a topic receives every message published after it
/// subscribed. There is no consumer group sharing.
pub struct ChannelBroker {
    inner: Arc<ChannelInner>,
    policy: DeliveryPolicy,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

struct ChannelInner {
    topics: RwLock<HashMap<String, broadcast::Sender<Payload>>>,
    /// Present only on recording brokers.
    published: Option<RwLock<HashMap<String, Vec<Payload>>>>,
    closed: AtomicBool,
}

impl ChannelInner {
    async fn sender(&self, topic: &str) -> broadcast::Sender<Payload> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    async fn send(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let payload = Arc::new(bytes);
        if let Some(published) = &self.published {
            published
                .write()
                .await
                .entry(topic.to_string())
                .or_default()
                .push(Arc::clone(&payload));
        }

        // No receivers is fine for publish-only scenarios
        let receivers = self.sender(topic).await.send(payload).unwrap_or(0);
        debug!(topic = %topic, receivers, "Published to channel");
        Ok(())
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelInner {
    async fn publish_dead_letter(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()> {
        let destination = dlq_topic(topic);
        self.send(&destination, dead_letter.to_json()?).await?;
        info!(
            topic = %destination,
            correlation_id = %dead_letter.correlation_id(),
            idempotency_id = %dead_letter.idempotency_id(),
            "Published dead letter"
        );
        Ok(())
    }
}

impl ChannelBroker {
    /// Create a new channel broker.
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self::build(policy, false)
    }

    /// Create a channel broker that records every published payload.
    ///
    /// Recorded payloads are never evicted. Use for tests only.
    pub fn recording(policy: DeliveryPolicy) -> Self {
        Self::build(policy, true)
    }

    fn build(policy: DeliveryPolicy, record: bool) -> Self {
        info!(
            max_attempts = policy.attempts(),
            recording = record,
            "Channel broker initialized"
        );
        Self {
            inner: Arc::new(ChannelInner {
                topics: RwLock::new(HashMap::new()),
                published: record.then(|| RwLock::new(HashMap::new())),
                closed: AtomicBool::new(false),
            }),
            policy,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Events published to `topic`, oldest first.
    ///
    /// Always empty unless the broker was built with [`ChannelBroker::recording`].
    pub async fn published_events(&self, topic: &str) -> Vec<Event> {
        self.published_raw(topic)
            .await
            .iter()
            .filter_map(|bytes| Event::from_json(bytes).ok())
            .collect()
    }

    /// Dead letters published for `topic`, oldest first.
    pub async fn dead_letters(&self, topic: &str) -> Vec<DeadLetter> {
        self.published_raw(&dlq_topic(topic))
            .await
            .iter()
            .filter_map(|bytes| DeadLetter::from_json(bytes).ok())
            .collect()
    }

    /// Inject raw bytes into a topic, bypassing validation.
    ///
    /// Lets tests deliver payloads no well-behaved producer would send.
    pub async fn publish_raw(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        self.inner.send(topic, bytes).await
    }

    async fn published_raw(&self, topic: &str) -> Vec<Payload> {
        match &self.inner.published {
            Some(published) => published.read().await.get(topic).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, event: &Event) -> Result<()> {
        event.validate()?;
        self.inner.send(topic, event.to_json()?).await?;

        debug!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            "Published event to channel"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let mut receiver = self.inner.sender(topic).await.subscribe();
        let shutdown = dispatch::link_shutdown(shutdown, &self.shutdown);
        let inner = Arc::clone(&self.inner);
        let policy = self.policy;
        let topic = topic.to_string();

        info!(topic = %topic, "Channel consumer started");

        let task = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(payload) => payload,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            error!(topic = %topic, skipped = n, "Channel consumer lagged, skipped messages");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let result = dispatch::process_message(
                    &payload,
                    &topic,
                    handler.as_ref(),
                    inner.as_ref(),
                    &policy,
                    &shutdown,
                )
                .await;
                debug!(topic = %topic, result = ?result, "Channel delivery finished");
            }
            info!(topic = %topic, "Channel consumer stopped");
        });

        self.tasks.lock().await.push(task);
        Ok(())
    }

    async fn publish_to_dlq(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()> {
        self.inner.publish_dead_letter(topic, dead_letter).await
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        dispatch::drain_tasks(tasks, self.policy.shutdown_timeout).await;
        self.inner.closed.store(true, Ordering::SeqCst);
        info!("Channel broker closed");
        Ok(())
    }
}
