//! Status notifier.
//!
//! Stateless consumer of `message.status.updated` events. Delivery of the
//! notification itself is simulated with a short delay and a log line.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::bus::{BusError, EventHandler};
use crate::contract::Event;

/// Service name used for the notifier's consumer group and logs.
pub const NOTIFIER_SERVICE_NAME: &str = "notification-service";

/// Logs every status change it receives.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    delay: Duration,
}

impl StatusNotifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Handle one status event. Returns the status that was notified.
    ///
    /// Events without a `status` field are logged and acknowledged.
    pub async fn notify(&self, event: &Event) -> Option<String> {
        info!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            event_id = %event.event_id,
            "Received message.status.updated event"
        );

        let Some(status) = event.payload_str("status") else {
            warn!(
                correlation_id = %event.correlation_id,
                idempotency_id = %event.idempotency_id,
                "Status not found in payload"
            );
            return None;
        };

        info!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            status = %status,
            "Sending notification"
        );
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        info!(
            correlation_id = %event.correlation_id,
            idempotency_id = %event.idempotency_id,
            status = %status,
            "Notification sent"
        );

        Some(status.to_string())
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl EventHandler for StatusNotifier {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), BusError>> {
        let notifier = self.clone();
        Box::pin(async move {
            notifier.notify(&event).await;
            Ok(())
        })
    }
}
