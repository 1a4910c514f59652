//! Message processor.
//!
//! Consumes `message.created` events and drives each logical message through
//! `pending → processing → processed`, then publishes
//! `message.status.updated`.
//!
//! Idempotency comes from the status store: `create_or_get` is atomic per
//! key, and any message that has left `pending` is treated as a duplicate
//! delivery and acknowledged without side effects.
//!
//! The one exception is a retry of a delivery this processor already
//! advanced part of the way. Its last committed status is remembered by
//! event ID, and the retry resumes from there so a failure after the first
//! transition still reaches the dead-letter path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, EventHandler, MessageBroker, MESSAGE_STATUS_UPDATED_TOPIC};
use crate::config::ProcessingConfig;
use crate::contract::{now_rfc3339, Event, Payload};
use crate::dlq::DeadLetter;
use crate::storage::{MessageStatus, StatusStore, StorageError};

/// Service name recorded in history rows written by the processor.
pub const PROCESSOR_SERVICE_NAME: &str = "message-processor";

/// Point in the processing algorithm where work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStage {
    /// Before the `processing` transition.
    Start,
    /// Before the `processed` transition.
    Finish,
}

impl std::fmt::Display for WorkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStage::Start => f.write_str("start"),
            WorkStage::Finish => f.write_str("finish"),
        }
    }
}

/// Error returned by a [`UnitOfWork`].
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {reason}")]
pub struct WorkError {
    pub stage: WorkStage,
    pub reason: String,
}

impl WorkError {
    pub fn new(stage: WorkStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// Domain work performed for each message.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn run(&self, stage: WorkStage, event: &Event) -> Result<(), WorkError>;
}

/// Work that only sleeps for a fixed duration per stage.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWork {
    start: Duration,
    finish: Duration,
}

impl SimulatedWork {
    pub fn new(start: Duration, finish: Duration) -> Self {
        Self { start, finish }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.start_delay(), config.finish_delay())
    }

    /// No delay at either stage.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

#[async_trait]
impl UnitOfWork for SimulatedWork {
    async fn run(&self, stage: WorkStage, _event: &Event) -> Result<(), WorkError> {
        let delay = match stage {
            WorkStage::Start => self.start,
            WorkStage::Finish => self.finish,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Failures while processing one event.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("failed to check/create message: {0}")]
    Lookup(#[source] StorageError),

    #[error("failed to update status to {status}: {source}")]
    StatusUpdate {
        status: MessageStatus,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error("failed to publish status update: {0}")]
    Publish(#[source] BusError),
}

impl From<ProcessingError> for BusError {
    fn from(e: ProcessingError) -> Self {
        BusError::HandlerFailed(e.to_string())
    }
}

/// What happened to an event that processed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The message moved to `processed` and a status event was published.
    Processed,
    /// The message had already left `pending`; nothing was done.
    Duplicate { status: MessageStatus },
}

/// Idempotent `message.created` handler.
#[derive(Clone)]
pub struct MessageProcessor {
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn MessageBroker>,
    work: Arc<dyn UnitOfWork>,
    service_name: String,
    /// Last status committed by an unfinished delivery, keyed by event ID.
    in_progress: Arc<Mutex<HashMap<String, MessageStatus>>>,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        broker: Arc<dyn MessageBroker>,
        work: Arc<dyn UnitOfWork>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            work,
            service_name: service_name.into(),
            in_progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Process one `message.created` event.
    pub async fn process(&self, event: &Event) -> Result<ProcessingOutcome, ProcessingError> {
        info!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            event_id = %event.event_id,
            "Received message.created event"
        );

        let record = self
            .store
            .create_or_get(&event.idempotency_id, &event.correlation_id, &event.payload)
            .await
            .map_err(ProcessingError::Lookup)?;

        let current = record.message.status;
        let resumed = self.in_progress.lock().await.get(&event.event_id).copied();
        let from = match resumed {
            Some(status) if status == current => {
                info!(
                    correlation_id = %event.correlation_id,
                    idempotency_id = %event.idempotency_id,
                    status = %current,
                    "Resuming partially processed delivery"
                );
                current
            }
            _ if record.existed && current != MessageStatus::Pending => {
                self.in_progress.lock().await.remove(&event.event_id);
                info!(
                    correlation_id = %event.correlation_id,
                    idempotency_id = %event.idempotency_id,
                    current_status = %current,
                    "Message already processed, skipping"
                );
                return Ok(ProcessingOutcome::Duplicate { status: current });
            }
            _ => MessageStatus::Pending,
        };

        debug!(
            idempotency_id = %event.idempotency_id,
            resumed = record.existed,
            "Processing message"
        );

        if from == MessageStatus::Pending {
            self.work.run(WorkStage::Start, event).await?;
            self.transition(event, MessageStatus::Processing, None).await?;
            self.remember(event, MessageStatus::Processing).await;
        }

        if from != MessageStatus::Processed {
            self.work.run(WorkStage::Finish, event).await?;
            self.transition(event, MessageStatus::Processed, None).await?;
            self.remember(event, MessageStatus::Processed).await;
        }

        let status_event = self.status_event(event, MessageStatus::Processed);
        self.broker
            .publish(MESSAGE_STATUS_UPDATED_TOPIC, &status_event)
            .await
            .map_err(ProcessingError::Publish)?;
        self.in_progress.lock().await.remove(&event.event_id);

        info!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            status = %MessageStatus::Processed,
            "Message processed successfully"
        );
        Ok(ProcessingOutcome::Processed)
    }

    /// Record `failed` for an event the delivery policy gave up on.
    ///
    /// Messages that already reached `processed`, or that were never
    /// recorded, are left alone.
    pub async fn record_failure(&self, dead_letter: &DeadLetter) -> Result<bool, ProcessingError> {
        let event = &dead_letter.original_event;
        self.in_progress.lock().await.remove(&event.event_id);
        if event.idempotency_id.is_empty() {
            return Ok(false);
        }

        let message = self
            .store
            .get_message(&event.idempotency_id)
            .await
            .map_err(ProcessingError::Lookup)?;

        match message {
            Some(message) if message.status != MessageStatus::Processed => {
                self.transition(event, MessageStatus::Failed, Some(&dead_letter.error))
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remember(&self, event: &Event, status: MessageStatus) {
        self.in_progress
            .lock()
            .await
            .insert(event.event_id.clone(), status);
    }

    async fn transition(
        &self,
        event: &Event,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<(), ProcessingError> {
        self.store
            .update_status(
                &event.idempotency_id,
                &event.correlation_id,
                status,
                &self.service_name,
                &event.event_id,
                error_message,
            )
            .await
            .map_err(|source| {
                error!(
                    correlation_id = %event.correlation_id,
                    idempotency_id = %event.idempotency_id,
                    status = %status,
                    error = %source,
                    "Failed to update message status"
                );
                ProcessingError::StatusUpdate { status, source }
            })
    }

    fn status_event(&self, event: &Event, status: MessageStatus) -> Event {
        let mut payload = Payload::new();
        payload.insert("idempotency_id".to_string(), json!(event.idempotency_id));
        payload.insert("status".to_string(), json!(status.as_str()));
        payload.insert("processed_at".to_string(), json!(now_rfc3339()));

        Event::new(
            MESSAGE_STATUS_UPDATED_TOPIC,
            event.correlation_id.clone(),
            event.idempotency_id.clone(),
            self.service_name.clone(),
            payload,
        )
    }
}

impl EventHandler for MessageProcessor {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), BusError>> {
        let processor = self.clone();
        Box::pin(async move {
            processor.process(&event).await?;
            Ok(())
        })
    }

    fn on_dead_letter(&self, dead_letter: Arc<DeadLetter>) -> BoxFuture<'static, ()> {
        let processor = self.clone();
        Box::pin(async move {
            match processor.record_failure(&dead_letter).await {
                Ok(true) => warn!(
                    correlation_id = %dead_letter.correlation_id(),
                    idempotency_id = %dead_letter.idempotency_id(),
                    error = %dead_letter.error,
                    "Message marked failed"
                ),
                Ok(false) => {}
                Err(e) => error!(
                    correlation_id = %dead_letter.correlation_id(),
                    idempotency_id = %dead_letter.idempotency_id(),
                    error = %e,
                    "Failed to record message failure"
                ),
            }
        })
    }
}
