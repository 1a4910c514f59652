//! msgflow-notifier: status notification service
//!
//! Subscribes to `message.status.updated` and logs a notification per
//! status change. Holds no state and needs no database.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use msgflow::bus::{init_broker, MESSAGE_STATUS_UPDATED_TOPIC};
use msgflow::config::Config;
use msgflow::handlers::{StatusNotifier, NOTIFIER_SERVICE_NAME};
use msgflow::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    config.messaging.messaging_type.require_networked()?;

    let broker = connect_with_retry("broker", || {
        init_broker(&config.messaging, config.delivery, NOTIFIER_SERVICE_NAME)
    })
    .await?;

    let notifier = StatusNotifier::new(config.processing.notify_delay());
    let shutdown = CancellationToken::new();
    broker
        .subscribe(
            MESSAGE_STATUS_UPDATED_TOPIC,
            Arc::new(notifier),
            shutdown.clone(),
        )
        .await?;

    info!(topic_in = MESSAGE_STATUS_UPDATED_TOPIC, "Notification service started");

    shutdown_signal().await;

    info!("Shutting down notification service");
    shutdown.cancel();
    broker.close().await?;

    Ok(())
}
