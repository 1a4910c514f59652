//! Delivery policy shared by every broker.
//!
//! Each adapter hands raw message bytes to [`process_message`] and maps the
//! returned [`DispatchResult`] onto its own acknowledgement primitive. This
//! keeps the retry and dead-letter behaviour identical across backends:
//!
//! 1. Bytes that do not decode as an event are dropped (`DecodeError`).
//! 2. Events failing contract validation are dead-lettered without a handler
//!    attempt.
//! 3. The handler is attempted up to `max_attempts` times with exponential
//!    backoff and jitter between attempts.
//! 4. When attempts are exhausted the event is published to `<topic>.dlq`
//!    and the handler's `on_dead_letter` hook runs.
//! 5. Shutdown during a backoff abandons the delivery unacknowledged so the
//!    broker redelivers it.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use super::EventHandler;
use crate::contract::Event;
use crate::dlq::{DeadLetter, DeadLetterPublisher};

/// Retry and shutdown settings for delivery loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Handler attempts per event before dead-lettering (minimum 1).
    pub max_attempts: u32,
    /// First retry delay.
    #[serde(with = "millis")]
    pub min_backoff: Duration,
    /// Upper bound for retry delays.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Pause before re-polling after a consumer/transport error.
    #[serde(with = "millis")]
    pub consume_error_backoff: Duration,
    /// How long `close()` waits for in-flight deliveries.
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            consume_error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    /// Policy with a single attempt: failures go straight to the DLQ.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    pub fn with_consume_error_backoff(mut self, delay: Duration) -> Self {
        self.consume_error_backoff = delay;
        self
    }

    /// Effective attempt count.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delays between attempts: one fewer than the attempt count.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff.max(self.min_backoff))
            .with_max_times(self.attempts() as usize - 1)
            .with_jitter()
            .build()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handler succeeded.
    Delivered,
    /// Event was published to the DLQ after `attempts` handler attempts.
    DeadLettered { attempts: u32 },
    /// Event left the normal path but the DLQ publish failed.
    DeadLetterFailed,
    /// Shutdown interrupted retries; the broker should redeliver.
    Abandoned,
    /// Message could not be decoded, no retry will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if the message should be positively acknowledged.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered { .. })
    }

    /// Returns true if the broker should see the message again.
    pub fn should_redeliver(&self) -> bool {
        matches!(self, Self::Abandoned)
    }
}

/// Decode a message payload and run it through the delivery policy.
pub async fn process_message(
    payload: &[u8],
    topic: &str,
    handler: &dyn EventHandler,
    dead_letters: &dyn DeadLetterPublisher,
    policy: &DeliveryPolicy,
    shutdown: &CancellationToken,
) -> DispatchResult {
    match Event::from_json(payload) {
        Ok(event) => deliver(Arc::new(event), topic, handler, dead_letters, policy, shutdown).await,
        Err(e) => {
            error!(topic = %topic, error = %e, "Failed to decode event");
            DispatchResult::DecodeError
        }
    }
}

/// Run a decoded event through the delivery policy.
pub async fn deliver(
    event: Arc<Event>,
    topic: &str,
    handler: &dyn EventHandler,
    dead_letters: &dyn DeadLetterPublisher,
    policy: &DeliveryPolicy,
    shutdown: &CancellationToken,
) -> DispatchResult {
    let span = info_span!(
        "handle",
        topic = %topic,
        event_id = %event.event_id,
        correlation_id = %event.correlation_id,
        idempotency_id = %event.idempotency_id,
    );

    async move {
        if let Err(e) = event.validate() {
            warn!(error = %e, "Rejecting invalid event");
            let dead_letter = DeadLetter::rejected((*event).clone(), e.to_string());
            return dead_letter_event(dead_letter, topic, handler, dead_letters).await;
        }

        let max_attempts = policy.attempts();
        let mut backoff = policy.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match handler.handle(Arc::clone(&event)).await {
                Ok(()) => {
                    debug!(attempt, "Event handled");
                    return DispatchResult::Delivered;
                }
                Err(e) => e,
            };

            match backoff.next() {
                Some(delay) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = %delay.as_millis(),
                        error = %error,
                        "Handler failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {
                            warn!(attempt, "Shutdown during retry backoff, leaving event for redelivery");
                            return DispatchResult::Abandoned;
                        }
                    }
                }
                _ => {
                    error!(attempts = attempt, error = %error, "Handler failed, dead-lettering event");
                    let dead_letter = DeadLetter::new((*event).clone(), error.to_string(), attempt);
                    return dead_letter_event(dead_letter, topic, handler, dead_letters).await;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn dead_letter_event(
    dead_letter: DeadLetter,
    topic: &str,
    handler: &dyn EventHandler,
    dead_letters: &dyn DeadLetterPublisher,
) -> DispatchResult {
    let attempts = dead_letter.retry_count;
    let result = match dead_letters.publish_dead_letter(topic, &dead_letter).await {
        Ok(()) => DispatchResult::DeadLettered { attempts },
        Err(e) => {
            error!(error = %e, "Failed to publish dead letter");
            DispatchResult::DeadLetterFailed
        }
    };

    handler.on_dead_letter(Arc::new(dead_letter)).await;
    result
}

/// Token cancelled by either the subscriber's token or the broker's shutdown.
pub(crate) fn link_shutdown(
    subscription: CancellationToken,
    broker: &CancellationToken,
) -> CancellationToken {
    let token = broker.child_token();
    let linked = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = subscription.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });
    token
}

/// Wait for delivery loops to finish, giving up after `timeout`.
pub(crate) async fn drain_tasks(tasks: Vec<tokio::task::JoinHandle<()>>, timeout: Duration) {
    if tasks.is_empty() {
        return;
    }
    let count = tasks.len();
    match tokio::time::timeout(timeout, futures::future::join_all(tasks)).await {
        Ok(_) => debug!(count, "Delivery loops stopped"),
        Err(_) => warn!(
            count,
            timeout_ms = %timeout.as_millis(),
            "Timed out waiting for delivery loops to stop"
        ),
    }
}

