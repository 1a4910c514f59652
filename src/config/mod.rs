//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod storage;

pub use storage::{PostgresConfig, SqliteConfig, StorageConfig, StorageType};

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{DeliveryPolicy, MessagingConfig, MessagingType};

/// Default configuration file name (extension optional).
pub const DEFAULT_CONFIG_FILE: &str = "msgflow";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MSGFLOW_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MSGFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MSGFLOW_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "MSGFLOW_LOG_FORMAT";

/// Legacy environment variable selecting the broker.
pub const MESSAGE_BROKER_ENV_VAR: &str = "MESSAGE_BROKER";
/// Legacy environment variable for Kafka bootstrap servers.
pub const KAFKA_BROKERS_ENV_VAR: &str = "KAFKA_BROKERS";
/// Legacy environment variable for the RabbitMQ URL.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";

/// Legacy database variables and the keys they override.
const LEGACY_DB_VARS: [(&str, &str); 5] = [
    ("DB_HOST", "storage.postgres.host"),
    ("DB_PORT", "storage.postgres.port"),
    ("DB_USER", "storage.postgres.user"),
    ("DB_PASSWORD", "storage.postgres.password"),
    ("DB_NAME", "storage.postgres.database"),
];

/// Errors raised while loading configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Durations of the simulated processing stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Work before the `processing` transition.
    pub start_delay_ms: u64,
    /// Work before the `processed` transition.
    pub finish_delay_ms: u64,
    /// Work done by the notifier per status event.
    pub notify_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 100,
            finish_delay_ms: 200,
            notify_delay_ms: 50,
        }
    }
}

impl ProcessingConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn finish_delay(&self) -> Duration {
        Duration::from_millis(self.finish_delay_ms)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Retry and dead-letter policy for subscriptions.
    pub delivery: DeliveryPolicy,
    /// Simulated work durations.
    pub processing: ProcessingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `msgflow.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy variables: `MESSAGE_BROKER`, `KAFKA_BROKERS`, `RABBITMQ_URL`, `DB_*`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        // Add config file from path argument if provided
        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        // Add config file from CONFIG_ENV_VAR env var if set
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        // Legacy env vars for backwards compatibility
        if let Ok(broker) = std::env::var(MESSAGE_BROKER_ENV_VAR) {
            let messaging_type: MessagingType = broker.parse().map_err(ConfigError::Invalid)?;
            builder = builder.set_override("messaging.type", messaging_type.as_str())?;
        }
        builder = builder
            .set_override_option(
                "messaging.kafka.bootstrap_servers",
                std::env::var(KAFKA_BROKERS_ENV_VAR).ok(),
            )?
            .set_override_option("messaging.amqp.url", std::env::var(RABBITMQ_URL_ENV_VAR).ok())?;
        for (var, key) in LEGACY_DB_VARS {
            builder = builder.set_override_option(key, std::env::var(var).ok())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
