//! Producer service: keeps the outbox drained to the broker.

use order_outbox::{outbox_relay, OutboxRoute, OutboxStore};
use pipeline_broker::Broker;
use pipeline_config_and_utils::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{cancel_on_ctrl_c, connect_broker, open_database};

pub async fn run_producer(config: Config) -> anyhow::Result<()> {
    let pool = open_database(&config, &config.database.producer_path)?;
    let broker = connect_broker(&config).await?;

    let route = OutboxRoute::from_config(&config.broker);
    broker.declare_queue(&route.queue).await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let relay = outbox_relay(
        OutboxStore::new(pool),
        broker,
        config.retry,
        config.outbox.clone(),
    )
    .spawn(&cancel);

    info!(queue = %route.queue.name, "Producer running");
    cancel.cancelled().await;

    let timeout = config.producer_shutdown_timeout();
    if relay.shutdown(timeout).await {
        info!("Producer stopped");
    } else {
        warn!(timeout_secs = timeout.as_secs(), "Producer shutdown was not clean");
    }
    Ok(())
}
