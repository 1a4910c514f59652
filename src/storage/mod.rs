//! Idempotency and status storage.
//!
//! The [`StatusStore`] exclusively owns two tables:
//! - `messages`: one row per idempotency key, carrying the current status
//! - `message_history`: append-only log of status transitions
//!
//! Implementations:
//! - `PostgresStatusStore` / `SqliteStatusStore`: sea-query + sqlx
//! - `MockStatusStore`: in-memory with failure injection, for tests

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::contract::Payload;

pub mod mock;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod schema;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod sql;

pub use mock::MockStatusStore;
#[cfg(feature = "postgres")]
pub use sql::postgres::PostgresStatusStore;
#[cfg(feature = "sqlite")]
pub use sql::sqlite::SqliteStatusStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: idempotency_id={0}")]
    NotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Lifecycle of a message: `pending → processing → processed`, `failed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "processed" => Ok(MessageStatus::Processed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(StorageError::InvalidStatus(other.to_string())),
        }
    }
}

/// Current state of a logical message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub idempotency_id: String,
    pub correlation_id: String,
    pub status: MessageStatus,
    /// Snapshot of the payload that created the message.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHistory {
    pub id: i64,
    pub idempotency_id: String,
    pub correlation_id: String,
    pub status: MessageStatus,
    pub service_name: String,
    pub event_id: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`StatusStore::create_or_get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrGet {
    pub message: Message,
    /// True when the row was already present before this call.
    pub existed: bool,
}

/// Durable record of message status, keyed by idempotency ID.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a `pending` message or return the existing one.
    ///
    /// Atomic per key: concurrent callers observe the same row and exactly
    /// one of them sees `existed == false`.
    async fn create_or_get(
        &self,
        idempotency_id: &str,
        correlation_id: &str,
        payload: &Payload,
    ) -> Result<CreateOrGet>;

    /// Set the status and append a history entry in one transaction.
    ///
    /// Returns `StorageError::NotFound` (writing nothing) for an unknown key.
    async fn update_status(
        &self,
        idempotency_id: &str,
        correlation_id: &str,
        status: MessageStatus,
        service_name: &str,
        event_id: &str,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn get_message(&self, idempotency_id: &str) -> Result<Option<Message>>;

    /// History entries, oldest first.
    async fn get_history(&self, idempotency_id: &str) -> Result<Vec<MessageHistory>>;
}

/// Initialize storage based on configuration.
///
/// Connects, applies migrations, and returns the store.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn StatusStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                let uri = config.postgres.connection_uri();
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.postgres.max_connections)
                    .connect(&uri)
                    .await?;

                let store = PostgresStatusStore::new(pool);
                store.migrate().await?;

                info!(
                    storage_type = "postgres",
                    host = %config.postgres.host,
                    database = %config.postgres.database,
                    "Storage initialized"
                );
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "postgres"))]
            {
                Err("Postgres storage requires the 'postgres' feature".into())
            }
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let path = &config.sqlite.path;
                let pool = if path == ":memory:" {
                    sqlx::sqlite::SqlitePoolOptions::new()
                        .max_connections(1)
                        .connect("sqlite::memory:")
                        .await?
                } else {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    // WAL lets readers proceed during a write; writers queue on the busy timeout.
                    let options = sqlx::sqlite::SqliteConnectOptions::new()
                        .filename(path)
                        .create_if_missing(true)
                        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                        .busy_timeout(std::time::Duration::from_secs(5));
                    sqlx::sqlite::SqlitePoolOptions::new()
                        .connect_with(options)
                        .await?
                };

                let store = SqliteStatusStore::new(pool);
                store.migrate().await?;

                info!(storage_type = "sqlite", path = %path, "Storage initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite storage requires the 'sqlite' feature".into())
            }
        }
    }
}
