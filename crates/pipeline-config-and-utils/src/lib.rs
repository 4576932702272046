//! Configuration, retry policy, logging, and shared errors for the order pipeline.

mod config;
mod error;
mod logging;
mod retry;

pub use config::{
    BrokerConfig, Config, DatabaseConfig, InboxWriteFailurePolicy, IntakeConfig, LogFormat,
    RelayConfig, DEFAULT_LOG_LEVEL, MAX_LEASE_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use retry::{RetryPolicy, MAX_BASE_DELAY_SECS};
