//! Configuration management for the pipeline services.

use crate::{CoreError, CoreResult, RetryPolicy, MAX_BASE_DELAY_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Largest relay lease a loaded config may carry.
pub const MAX_LEASE_SECS: u64 = 86_400;

/// Default queue carrying order-created audit events.
const DEFAULT_QUEUE_NAME: &str = "oms.order.created";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// What the intake does with a delivery whose inbox write failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxWriteFailurePolicy {
    /// Acknowledge anyway and report the event as lost.
    #[default]
    Acknowledge,
    /// Hand the delivery back to the broker for redelivery.
    Requeue,
}

/// Main pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Producer-side relay.
    #[serde(default)]
    pub outbox: RelayConfig,
    /// Consumer-side relay.
    #[serde(default)]
    pub inbox: RelayConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Graceful shutdown bound for the producer service.
    #[serde(default = "default_producer_shutdown_secs")]
    pub producer_shutdown_timeout_secs: u64,
    /// Graceful shutdown bound for the consumer service.
    #[serde(default = "default_consumer_shutdown_secs")]
    pub consumer_shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            database: DatabaseConfig::default(),
            broker: BrokerConfig::default(),
            retry: RetryPolicy::default(),
            outbox: RelayConfig::default(),
            inbox: RelayConfig::default(),
            intake: IntakeConfig::default(),
            producer_shutdown_timeout_secs: default_producer_shutdown_secs(),
            consumer_shutdown_timeout_secs: default_consumer_shutdown_secs(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_producer_shutdown_secs() -> u64 {
    10
}

fn default_consumer_shutdown_secs() -> u64 {
    5
}

/// SQLite database settings.
///
/// The producer and the consumer each own a database file. A producer batch
/// holds its write lock while it publishes, so the two must not share one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Orders and the outbox. Used by `producer`, `submit` and `status`.
    pub producer_path: PathBuf,
    /// Audit rows and the inbox. Used by `consumer` and `status`.
    pub consumer_path: PathBuf,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            producer_path: PathBuf::from("data/order-producer.db"),
            consumer_path: PathBuf::from("data/order-consumer.db"),
            max_connections: 10,
            connection_timeout_secs: 30,
        }
    }
}

/// Broker connection and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub queue_name: String,
    /// Empty string selects the default exchange, which routes by queue name.
    /// The Redis binding has no other exchanges, so `validate` requires empty.
    pub exchange_name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub consumer_group: String,
    pub block_timeout_ms: u64,
    pub read_count: usize,
    /// Bound on one synchronous publish from the producer.
    pub publish_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            exchange_name: String::new(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            consumer_group: "order-audit".to_string(),
            block_timeout_ms: 5000,
            read_count: 10,
            publish_timeout_ms: 5000,
        }
    }
}

/// Polling settings for one relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// How long a claimed row stays reserved for the claiming relay.
    pub lease_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_size: 100,
            lease_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Clamped to [`MAX_LEASE_SECS`].
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(MAX_LEASE_SECS) as i64)
    }
}

/// Consumer intake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Upper bound on deliveries processed concurrently.
    pub max_workers: usize,
    pub consumer_tag: String,
    pub on_inbox_write_failure: InboxWriteFailurePolicy,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            consumer_tag: "consumer-svc".to_string(),
            on_inbox_write_failure: InboxWriteFailurePolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then apply environment overrides.
    ///
    /// A path that does not exist yields the defaults.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("ORDER_PIPELINE_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(path) = std::env::var("ORDER_PIPELINE_PRODUCER_DATABASE") {
            self.database.producer_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ORDER_PIPELINE_CONSUMER_DATABASE") {
            self.database.consumer_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.broker.redis_url = url;
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.retry.max_retries < 1 {
            return Err(CoreError::Config("retry.max_retries must be at least 1".into()));
        }
        if self.retry.base_delay_secs == 0 || self.retry.base_delay_secs > MAX_BASE_DELAY_SECS {
            return Err(CoreError::Config(format!(
                "retry.base_delay_secs must be between 1 and {MAX_BASE_DELAY_SECS}"
            )));
        }
        for (name, relay) in [("outbox", &self.outbox), ("inbox", &self.inbox)] {
            if relay.batch_size == 0 || relay.poll_interval_secs == 0 {
                return Err(CoreError::Config(format!(
                    "{name} relay needs a positive batch_size and poll_interval_secs"
                )));
            }
            if relay.lease_secs == 0 || relay.lease_secs > MAX_LEASE_SECS {
                return Err(CoreError::Config(format!(
                    "{name}.lease_secs must be between 1 and {MAX_LEASE_SECS}"
                )));
            }
        }
        if !self.broker.exchange_name.is_empty() {
            // The Redis Streams binding only routes through the default exchange.
            return Err(CoreError::Config(format!(
                "broker.exchange_name '{}' has no bindings; leave it empty",
                self.broker.exchange_name
            )));
        }
        if self.broker.publish_timeout_ms == 0 {
            return Err(CoreError::Config("broker.publish_timeout_ms must be positive".into()));
        }
        if self.database.producer_path == self.database.consumer_path {
            return Err(CoreError::Config(
                "database.producer_path and database.consumer_path must differ".into(),
            ));
        }
        if self.intake.max_workers == 0 {
            return Err(CoreError::Config("intake.max_workers must be positive".into()));
        }
        if self.broker.queue_name.is_empty() {
            return Err(CoreError::Config("broker.queue_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.publish_timeout_ms)
    }

    pub fn producer_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_shutdown_timeout_secs)
    }

    pub fn consumer_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_shutdown_timeout_secs)
    }
}
