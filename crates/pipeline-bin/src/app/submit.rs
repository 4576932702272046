//! One-shot order submission from a JSON file.

use std::path::Path;

use anyhow::Context;
use order_outbox::{AuditDispatch, OutboxRoute, ProducerTransactionCoordinator};
use pipeline_config_and_utils::Config;
use pipeline_database::NewOrder;

use super::{connect_broker, open_database};

/// Read a JSON array of orders.
pub(crate) fn read_orders(path: &Path) -> anyhow::Result<Vec<NewOrder>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let orders = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of orders", path.display()))?;
    Ok(orders)
}

pub async fn submit_orders(config: Config, path: &Path) -> anyhow::Result<()> {
    let orders = read_orders(path)?;
    let pool = open_database(&config, &config.database.producer_path)?;
    let broker = connect_broker(&config).await?;

    let coordinator = ProducerTransactionCoordinator::new(
        pool,
        broker,
        OutboxRoute::from_config(&config.broker),
        config.retry,
    )
    .await?
    .with_publish_timeout(config.publish_timeout());

    let report = coordinator.create_orders(orders).await?;
    println!("Created {} orders", report.orders.len());
    for dispatch in &report.dispatch {
        match dispatch.dispatch {
            AuditDispatch::Published => println!("  order {}: published", dispatch.order_id),
            AuditDispatch::Queued { outbox_id } => {
                println!("  order {}: queued in outbox (#{outbox_id})", dispatch.order_id)
            }
        }
    }
    Ok(())
}
