//! msgflow-processor: idempotent message processor
//!
//! Subscribes to `message.created`, advances each message through
//! `pending → processing → processed` in the status store and publishes
//! `message.status.updated`.
//!
//! ## Configuration
//! - MSGFLOW_CONFIG: path to a YAML config file (optional)
//! - MESSAGE_BROKER: `kafka` (default) or `rabbitmq`
//! - KAFKA_BROKERS / RABBITMQ_URL: broker address
//! - DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_NAME: PostgreSQL connection

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use msgflow::bus::{init_broker, MESSAGE_CREATED_TOPIC, MESSAGE_STATUS_UPDATED_TOPIC};
use msgflow::config::Config;
use msgflow::handlers::{MessageProcessor, SimulatedWork, PROCESSOR_SERVICE_NAME};
use msgflow::storage::init_storage;
use msgflow::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    config.messaging.messaging_type.require_networked()?;

    let store = connect_with_retry("storage", || init_storage(&config.storage)).await?;
    let broker = connect_with_retry("broker", || {
        init_broker(&config.messaging, config.delivery, PROCESSOR_SERVICE_NAME)
    })
    .await?;

    let processor = MessageProcessor::new(
        store,
        broker.clone(),
        Arc::new(SimulatedWork::from_config(&config.processing)),
        PROCESSOR_SERVICE_NAME,
    );

    let shutdown = CancellationToken::new();
    broker
        .subscribe(MESSAGE_CREATED_TOPIC, Arc::new(processor), shutdown.clone())
        .await?;

    info!(
        topic_in = MESSAGE_CREATED_TOPIC,
        topic_out = MESSAGE_STATUS_UPDATED_TOPIC,
        "Message processor started"
    );

    shutdown_signal().await;

    info!("Shutting down message processor");
    shutdown.cancel();
    broker.close().await?;

    Ok(())
}
