//! msgflow-produce: create a message or look up its status
//!
//! ```text
//! msgflow-produce <content> [metadata-json]
//! msgflow-produce --status <id>
//! ```
//!
//! Prints the result as JSON on stdout. Uses the same configuration sources
//! as the other binaries.

use serde_json::json;

use msgflow::bus::init_broker;
use msgflow::config::Config;
use msgflow::contract::Payload;
use msgflow::producer::{MessageProducer, PRODUCER_SERVICE_NAME};
use msgflow::storage::init_storage;
use msgflow::utils::bootstrap::init_tracing;

const USAGE: &str = "usage: msgflow-produce <content> [metadata-json] | msgflow-produce --status <id>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::load(None)?;
    config.messaging.messaging_type.require_networked()?;

    let store = init_storage(&config.storage).await?;
    let broker = init_broker(&config.messaging, config.delivery, PRODUCER_SERVICE_NAME).await?;
    let producer = MessageProducer::new(store, broker.clone());

    let output = match args.as_slice() {
        [flag, id] if flag == "--status" => match producer.message_status(id).await? {
            Some(report) => serde_json::to_value(report)?,
            None => json!({ "id": id, "status": "not_found" }),
        },
        [content] => serde_json::to_value(producer.create_message(content, None).await?)?,
        [content, metadata] => {
            let metadata: Payload = serde_json::from_str(metadata)?;
            serde_json::to_value(producer.create_message(content, Some(metadata)).await?)?
        }
        _ => return Err(USAGE.into()),
    };

    broker.close().await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
