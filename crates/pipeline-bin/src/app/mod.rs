//! Service wiring for the order pipeline binary.

mod consumer;
mod producer;
mod status;
mod submit;

pub use consumer::run_consumer;
pub use producer::run_producer;
pub use status::show_status;
pub use submit::submit_orders;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pipeline_broker::{Broker, RedisBrokerConfig, RedisStreamsBroker};
use pipeline_config_and_utils::Config;
use pipeline_database::{DatabasePool, PoolConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Open one side's database with the shared pool settings.
pub(crate) fn open_database(config: &Config, path: &Path) -> anyhow::Result<DatabasePool> {
    let pool = DatabasePool::open(
        path,
        PoolConfig {
            max_size: config.database.max_connections,
            connection_timeout: Duration::from_secs(config.database.connection_timeout_secs),
            ..Default::default()
        },
    )?;
    Ok(pool)
}

pub(crate) async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisStreamsBroker::connect(RedisBrokerConfig {
        redis_url: config.broker.redis_url.clone(),
        consumer_group: config.broker.consumer_group.clone(),
        block_timeout_ms: config.broker.block_timeout_ms,
        read_count: config.broker.read_count,
    })
    .await?;
    Ok(Arc::new(broker))
}

/// Cancel `token` on Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal, stopping"),
        }
        token.cancel();
    });
}
