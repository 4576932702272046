//! Schema for orders, audit rows and the outbox/inbox/dead-letter queues.
//!
//! Each step records its version in `migrations`; steps already recorded are
//! skipped on the next open. Queue tables store timestamps as Unix milliseconds so that due-row
//! selection can compare and index them numerically.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Highest version any step records.
pub const CURRENT_VERSION: i32 = 5;

/// Bring `conn` up to [`CURRENT_VERSION`].
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(version = current_version, "Pipeline schema up to date");
        return Ok(());
    }
    info!(from = current_version, to = CURRENT_VERSION, "Upgrading pipeline schema");

    if current_version < 1 {
        migrate_v1_orders(conn)?;
    }
    if current_version < 2 {
        migrate_v2_outbox(conn)?;
    }
    if current_version < 3 {
        migrate_v3_inbox(conn)?;
    }
    if current_version < 4 {
        migrate_v4_audit_log_order(conn)?;
    }
    if current_version < 5 {
        migrate_v5_dead_letters(conn)?;
    }

    info!(version = CURRENT_VERSION, "Pipeline schema upgraded");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Schema step applied");
    Ok(())
}

/// V1: Orders and their line items.
fn migrate_v1_orders(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL,
            delivery_address TEXT NOT NULL,
            total_price_cents INTEGER NOT NULL,
            total_price_currency TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders(customer_id);

        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            product_id INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            product_title TEXT NOT NULL,
            product_url TEXT NOT NULL DEFAULT '',
            price_cents INTEGER NOT NULL,
            price_currency TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        ",
    )?;
    record_migration(conn, 1, "orders")
}

/// V2: Producer outbox.
fn migrate_v2_outbox(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_name TEXT NOT NULL,
            exchange_name TEXT NOT NULL DEFAULT '',
            routing_key TEXT NOT NULL,
            payload BLOB NOT NULL,
            content_type TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            next_retry_at INTEGER NOT NULL,
            locked_by TEXT,
            locked_until INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_due
            ON outbox(next_retry_at) WHERE retry_count < max_retries;
        ",
    )?;
    record_migration(conn, 2, "outbox")
}

/// V3: Consumer inbox.
fn migrate_v3_inbox(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS inbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            queue_name TEXT NOT NULL,
            routing_key TEXT NOT NULL,
            payload BLOB NOT NULL,
            content_type TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            delivery_tag INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            next_retry_at INTEGER NOT NULL,
            locked_by TEXT,
            locked_until INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_inbox_due
            ON inbox(next_retry_at) WHERE retry_count < max_retries;
        ",
    )?;
    record_migration(conn, 3, "inbox")
}

/// V4: Audit records written by the consumer.
fn migrate_v4_audit_log_order(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_log_order (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            order_item_id INTEGER NOT NULL,
            customer_id INTEGER NOT NULL,
            order_status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_order_order ON audit_log_order(order_id);
        ",
    )?;
    record_migration(conn, 4, "audit_log_order")
}

/// V5: Terminal sink for abandoned queue rows.
fn migrate_v5_dead_letters(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            side TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            message_id TEXT,
            queue_name TEXT NOT NULL,
            exchange_name TEXT NOT NULL DEFAULT '',
            routing_key TEXT NOT NULL,
            payload BLOB NOT NULL,
            content_type TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT,
            reason TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            abandoned_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_side ON dead_letters(side, abandoned_at);
        ",
    )?;
    record_migration(conn, 5, "dead_letters")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in [
            "orders",
            "order_items",
            "outbox",
            "inbox",
            "audit_log_order",
            "dead_letters",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_VERSION as i64);
    }

    #[test]
    fn test_due_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'index' AND name IN ('idx_outbox_due', 'idx_inbox_due')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
