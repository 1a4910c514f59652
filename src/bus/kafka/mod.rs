//! Kafka broker implementation.
//!
//! Topics map one-to-one to broker topics; dead letters go to `<topic>.dlq`.
//! Message key: idempotency ID (ensures ordering per logical message)
//! Headers: `correlation_id`, `idempotency_id`, `event_type`
//!
//! Each subscription owns a consumer in the configured group. Messages are
//! handled sequentially in partition order and the offset is committed once
//! the delivery policy has finished with a message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{self, DeliveryPolicy, DispatchResult};
use super::{BusError, EventHandler, MessageBroker, Result};
use crate::contract::Event;
use crate::dlq::{dlq_topic, DeadLetter, DeadLetterPublisher};

/// Producer queue timeout for a single send.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close()` waits for queued messages to be delivered.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID shared by every subscription of this process.
    pub group_id: String,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl KafkaBrokerConfig {
    /// Create config; the consumer group defaults to the service name.
    pub fn new(bootstrap_servers: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: service_name.into(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Override the consumer group.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config.set("message.send.max.retries", "5");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers.
    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("partition.assignment.strategy", "roundrobin");

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Correlation headers attached to every record.
fn event_headers(event: &Event) -> OwnedHeaders {
    OwnedHeaders::new()
        .insert(Header {
            key: "correlation_id",
            value: Some(event.correlation_id.as_str()),
        })
        .insert(Header {
            key: "idempotency_id",
            value: Some(event.idempotency_id.as_str()),
        })
        .insert(Header {
            key: "event_type",
            value: Some(event.event_type.as_str()),
        })
}

/// Producer half, shared with delivery loops for dead-lettering.
struct KafkaProducer {
    producer: FutureProducer,
    closed: AtomicBool,
}

impl KafkaProducer {
    async fn send(&self, topic: &str, event: &Event, payload: &[u8]) -> Result<(i32, i64)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let record = FutureRecord::to(topic)
            .key(event.idempotency_id.as_str())
            .headers(event_headers(event))
            .payload(payload);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish to {}: {}", topic, e)))
    }
}

#[async_trait]
impl DeadLetterPublisher for KafkaProducer {
    async fn publish_dead_letter(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()> {
        let destination = dlq_topic(topic);
        let payload = dead_letter.to_json()?;
        let (partition, offset) = self
            .send(&destination, &dead_letter.original_event, &payload)
            .await?;

        info!(
            topic = %destination,
            partition,
            offset,
            correlation_id = %dead_letter.correlation_id(),
            idempotency_id = %dead_letter.idempotency_id(),
            retry_count = dead_letter.retry_count,
            "Published dead letter"
        );
        Ok(())
    }
}

/// Kafka broker implementation.
pub struct KafkaBroker {
    producer: Arc<KafkaProducer>,
    config: KafkaBrokerConfig,
    policy: DeliveryPolicy,
    shutdown: CancellationToken,
    closing: AtomicBool,
    consumers: Mutex<Vec<Arc<StreamConsumer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaBroker {
    /// Create a new Kafka broker.
    ///
    /// The producer connects lazily; consumers are created per subscription.
    pub fn new(config: KafkaBrokerConfig, policy: DeliveryPolicy) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "Connected to Kafka"
        );

        Ok(Self {
            producer: Arc::new(KafkaProducer {
                producer,
                closed: AtomicBool::new(false),
            }),
            config,
            policy,
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn create_consumer(&self, topic: &str) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to {}: {}", topic, e)))?;
        Ok(consumer)
    }
}

/// Consume until shutdown, committing each message once it is dealt with.
async fn consume_loop(
    consumer: Arc<StreamConsumer>,
    topic: String,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<KafkaProducer>,
    policy: DeliveryPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                error!(topic = %topic, error = %e, "Kafka consumer error");
                tokio::select! {
                    _ = tokio::time::sleep(policy.consume_error_backoff) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }
        };

        debug!(
            topic = %message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "Received message"
        );

        let result = match message.payload() {
            Some(payload) => {
                dispatch::process_message(
                    payload,
                    &topic,
                    handler.as_ref(),
                    dead_letters.as_ref(),
                    &policy,
                    &shutdown,
                )
                .await
            }
            None => {
                warn!(topic = %topic, offset = message.offset(), "Received message with no payload");
                DispatchResult::DecodeError
            }
        };

        if result.should_redeliver() {
            // Offset stays uncommitted; the group redelivers after rebalance.
            break;
        }

        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            error!(topic = %topic, error = %e, "Failed to commit offset");
        }
    }

    info!(topic = %topic, "Kafka consumer stopped");
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, event: &Event) -> Result<()> {
        event.validate()?;
        let payload = event.to_json()?;

        let (partition, offset) = self.producer.send(topic, event, &payload).await?;

        info!(
            partition,
            offset,
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            "Published event to Kafka"
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

        let consumer = Arc::new(self.create_consumer(topic)?);
        self.consumers.lock().await.push(Arc::clone(&consumer));

        info!(
            topic = %topic,
            group_id = %self.config.group_id,
            "Subscribed to Kafka topic"
        );

        let task = tokio::spawn(consume_loop(
            consumer,
            topic.to_string(),
            handler,
            Arc::clone(&self.producer),
            self.policy,
            dispatch::link_shutdown(shutdown, &self.shutdown),
        ));
        self.tasks.lock().await.push(task);
        Ok(())
    }

    async fn publish_to_dlq(&self, topic: &str, dead_letter: &DeadLetter) -> Result<()> {
        self.producer.publish_dead_letter(topic, dead_letter).await
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Let in-flight deliveries finish while the producer is still open.
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        dispatch::drain_tasks(tasks, self.policy.shutdown_timeout).await;

        self.producer.closed.store(true, Ordering::SeqCst);

        let producer = self.producer.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await {
            Ok(Ok(())) => debug!("Kafka producer flushed"),
            Ok(Err(e)) => warn!(error = %e, "Kafka producer flush failed"),
            Err(e) => warn!(error = %e, "Kafka producer flush task failed"),
        }

        for consumer in std::mem::take(&mut *self.consumers.lock().await) {
            consumer.unsubscribe();
        }

        info!("Kafka broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
