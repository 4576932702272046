//! Queue depth and dead-letter report for both sides.

use pipeline_config_and_utils::Config;
use pipeline_database::{queries, DatabasePool, QueueDepths};

use super::open_database;

pub async fn show_status(config: Config) -> anyhow::Result<()> {
    let producer = open_database(&config, &config.database.producer_path)?;
    let consumer = open_database(&config, &config.database.consumer_path)?;

    print_side("Producer", "Outbox", &producer, |depths| depths.outbox).await?;
    print_side("Consumer", "Inbox", &consumer, |depths| depths.inbox).await?;
    Ok(())
}

async fn print_side(
    side: &str,
    queue: &str,
    pool: &DatabasePool,
    depth: fn(&QueueDepths) -> i64,
) -> anyhow::Result<()> {
    let (depths, dead_letters) = pool
        .call(|conn| Ok((queries::queue_depths(conn)?, queries::list_dead_letters(conn, None)?)))
        .await?;

    let state = pool.state();
    println!(
        "{side} database: {} ({} connections, {} idle)",
        pool.path(),
        state.connections,
        state.idle_connections
    );
    println!("  {queue}: {}", depth(&depths));
    println!("  Dead letters: {}", depths.dead_letters);
    for letter in dead_letters.iter().rev().take(10) {
        println!(
            "    [{}] {} #{} {} after {} retries: {}",
            letter.abandoned_at.to_rfc3339(),
            letter.side.as_str(),
            letter.source_id,
            letter.reason.as_str(),
            letter.retry_count,
            letter.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
