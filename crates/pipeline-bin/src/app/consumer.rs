//! Consumer service: intake plus inbox relay.

use std::sync::Arc;

use audit_inbox::{inbox_relay, AuditLogService, AuditProcessor, InboxStore, MessageIntake};
use pipeline_broker::QueueOptions;
use pipeline_config_and_utils::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{cancel_on_ctrl_c, connect_broker, open_database};

pub async fn run_consumer(config: Config) -> anyhow::Result<()> {
    let pool = open_database(&config, &config.database.consumer_path)?;
    let broker = connect_broker(&config).await?;

    let processor: Arc<dyn AuditProcessor> = Arc::new(AuditLogService::new(pool.clone()));
    let store = InboxStore::new(pool);
    let queue = QueueOptions {
        name: config.broker.queue_name.clone(),
        durable: config.broker.durable,
        exclusive: config.broker.exclusive,
        auto_delete: config.broker.auto_delete,
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let intake = MessageIntake::new(
        broker,
        Arc::clone(&processor),
        store.clone(),
        queue,
        config.retry,
        config.intake.clone(),
    )
    .start(&cancel)
    .await?;
    let relay = inbox_relay(store, processor, config.retry, config.inbox.clone()).spawn(&cancel);

    info!(queue = %config.broker.queue_name, "Consumer running");
    cancel.cancelled().await;

    let timeout = config.consumer_shutdown_timeout();
    let (intake_clean, relay_clean) =
        tokio::join!(intake.shutdown(timeout), relay.shutdown(timeout));
    if intake_clean && relay_clean {
        info!("Consumer stopped");
    } else {
        warn!(timeout_secs = timeout.as_secs(), "Consumer shutdown was not clean");
    }
    Ok(())
}
