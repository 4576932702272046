//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so the same
//! helpers run on a pooled connection inside [`crate::DatabasePool::call`] or on
//! the connection of an open [`crate::UnitOfWork`].

use crate::{
    AbandonReason, AuditLogOrder, Currency, DatabaseError, DatabaseResult, DeadLetter,
    InboxInsert, InboxMessage, NewInboxMessage, NewOrder, NewOrderItem, NewOutboxMessage, Order,
    OrderItem, OrderQuery, OutboxMessage, QueueDepths, QueueSide,
};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::HashMap;
use tracing::debug;

// ==========================================
// Orders
// ==========================================

/// Insert a batch of orders and their items, returning them with generated ids.
pub fn bulk_insert_orders(
    conn: &Connection,
    orders: &[NewOrder],
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<Order>> {
    let ts = now.to_rfc3339();
    let mut created = Vec::with_capacity(orders.len());
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO orders (customer_id, delivery_address, total_price_cents, total_price_currency, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )?;
        for new in orders {
            stmt.execute(params![
                new.customer_id,
                new.delivery_address,
                new.total_price_cents,
                new.total_price_currency.as_str(),
                ts,
            ])?;
            created.push(Order {
                id: conn.last_insert_rowid(),
                customer_id: new.customer_id,
                delivery_address: new.delivery_address.clone(),
                total_price_cents: new.total_price_cents,
                total_price_currency: new.total_price_currency,
                created_at: now,
                updated_at: now,
                order_items: Vec::new(),
            });
        }
    }

    for (order, new) in created.iter_mut().zip(orders) {
        order.order_items = bulk_insert_order_items(conn, order.id, &new.order_items, now)?;
    }

    debug!(count = created.len(), "Inserted orders");
    Ok(created)
}

/// Insert the items of one order.
pub fn bulk_insert_order_items(
    conn: &Connection,
    order_id: i64,
    items: &[NewOrderItem],
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<OrderItem>> {
    let ts = now.to_rfc3339();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO order_items (order_id, product_id, quantity, product_title, product_url, price_cents, price_currency, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
    )?;

    let mut created = Vec::with_capacity(items.len());
    for item in items {
        stmt.execute(params![
            order_id,
            item.product_id,
            item.quantity,
            item.product_title,
            item.product_url,
            item.price_cents,
            item.price_currency.as_str(),
            ts,
        ])?;
        created.push(OrderItem {
            id: conn.last_insert_rowid(),
            order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            product_title: item.product_title.clone(),
            product_url: item.product_url.clone(),
            price_cents: item.price_cents,
            price_currency: item.price_currency,
            created_at: now,
            updated_at: now,
        });
    }
    Ok(created)
}

/// Read orders matching `query`, with their items attached, ordered by id.
pub fn query_orders(conn: &Connection, query: &OrderQuery) -> DatabaseResult<Vec<Order>> {
    let mut sql = String::from(
        "SELECT id, customer_id, delivery_address, total_price_cents, total_price_currency, created_at, updated_at
         FROM orders",
    );
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if !query.ids.is_empty() {
        clauses.push(format!("id IN ({})", placeholders(query.ids.len())));
        values.extend(query.ids.iter().map(|id| Value::Integer(*id)));
    }
    if !query.customer_ids.is_empty() {
        clauses.push(format!(
            "customer_id IN ({})",
            placeholders(query.customer_ids.len())
        ));
        values.extend(query.customer_ids.iter().map(|id| Value::Integer(*id)));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id ASC");
    match (query.limit, query.offset) {
        (Some(limit), _) => {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit));
        }
        (None, Some(_)) => sql.push_str(" LIMIT -1"),
        (None, None) => {}
    }
    if let Some(offset) = query.offset {
        sql.push_str(" OFFSET ?");
        values.push(Value::Integer(offset));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut orders = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(Order {
                id: row.get(0)?,
                customer_id: row.get(1)?,
                delivery_address: row.get(2)?,
                total_price_cents: row.get(3)?,
                total_price_currency: currency_column(row, 4)?,
                created_at: parse_datetime(row.get::<_, String>(5)?),
                updated_at: parse_datetime(row.get::<_, String>(6)?),
                order_items: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let order_ids: Vec<i64> = orders.iter().map(|o| o.id).collect();
    let mut items_by_order: HashMap<i64, Vec<OrderItem>> = HashMap::new();
    for item in query_order_items(conn, &order_ids)? {
        items_by_order.entry(item.order_id).or_default().push(item);
    }
    for order in &mut orders {
        order.order_items = items_by_order.remove(&order.id).unwrap_or_default();
    }

    Ok(orders)
}

/// Read the items of the given orders, ordered by id.
pub fn query_order_items(conn: &Connection, order_ids: &[i64]) -> DatabaseResult<Vec<OrderItem>> {
    if order_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT id, order_id, product_id, quantity, product_title, product_url, price_cents, price_currency, created_at, updated_at
         FROM order_items
         WHERE order_id IN ({})
         ORDER BY id ASC",
        placeholders(order_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(order_ids.iter()), |row| {
            Ok(OrderItem {
                id: row.get(0)?,
                order_id: row.get(1)?,
                product_id: row.get(2)?,
                quantity: row.get(3)?,
                product_title: row.get(4)?,
                product_url: row.get(5)?,
                price_cents: row.get(6)?,
                price_currency: currency_column(row, 7)?,
                created_at: parse_datetime(row.get::<_, String>(8)?),
                updated_at: parse_datetime(row.get::<_, String>(9)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

// ==========================================
// Audit log
// ==========================================

/// Persist audit records, returning their generated ids.
pub fn save_audit_logs(conn: &Connection, logs: &[AuditLogOrder]) -> DatabaseResult<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO audit_log_order (order_id, order_item_id, customer_id, order_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut ids = Vec::with_capacity(logs.len());
    for log in logs {
        stmt.execute(params![
            log.order_id,
            log.order_item_id,
            log.customer_id,
            log.order_status,
            log.created_at.to_rfc3339(),
            log.updated_at.to_rfc3339(),
        ])?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

/// List audit records, optionally for a single order.
pub fn list_audit_logs(
    conn: &Connection,
    order_id: Option<i64>,
) -> DatabaseResult<Vec<AuditLogOrder>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, order_id, order_item_id, customer_id, order_status, created_at, updated_at
         FROM audit_log_order
         WHERE ?1 IS NULL OR order_id = ?1
         ORDER BY id ASC",
    )?;
    let logs = stmt
        .query_map(params![order_id], |row| {
            Ok(AuditLogOrder {
                id: row.get(0)?,
                order_id: row.get(1)?,
                order_item_id: row.get(2)?,
                customer_id: row.get(3)?,
                order_status: row.get(4)?,
                created_at: parse_datetime(row.get::<_, String>(5)?),
                updated_at: parse_datetime(row.get::<_, String>(6)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(logs)
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str = "id, queue_name, exchange_name, routing_key, payload, content_type, retry_count, max_retries, last_error, created_at, updated_at, next_retry_at";

/// Enqueue an outbox message, returning its id.
pub fn insert_outbox_message(
    conn: &Connection,
    message: &NewOutboxMessage,
    now: DateTime<Utc>,
) -> DatabaseResult<i64> {
    conn.execute(
        "INSERT INTO outbox (queue_name, exchange_name, routing_key, payload, content_type, retry_count, max_retries, last_error, created_at, updated_at, next_retry_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10)",
        params![
            message.queue_name,
            message.exchange_name,
            message.routing_key,
            message.payload,
            message.content_type,
            message.retry_count,
            message.max_retries,
            message.last_error,
            to_millis(now),
            to_millis(message.next_retry_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claim up to `limit` due outbox rows for `owner` until `lease_until`.
///
/// A row is due when `next_retry_at <= now`, it still has retries left, and
/// no other owner holds an unexpired lease on it. Rows come back oldest-due
/// first.
pub fn claim_due_outbox_messages(
    conn: &Connection,
    owner: &str,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxMessage>> {
    let sql = claim_sql(QueueSide::Outbox, OUTBOX_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt
        .query_map(
            params![owner, to_millis(lease_until), to_millis(now), limit as i64],
            outbox_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by_key(|m| (m.next_retry_at, m.id));
    Ok(rows)
}

/// Get an outbox message by id.
pub fn get_outbox_message(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxMessage>> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    match stmt.query_row(params![id], outbox_from_row) {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List every outbox row in queue order.
pub fn list_outbox_messages(conn: &Connection) -> DatabaseResult<Vec<OutboxMessage>> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY id ASC");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([], outbox_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: row.get(0)?,
        queue_name: row.get(1)?,
        exchange_name: row.get(2)?,
        routing_key: row.get(3)?,
        payload: row.get(4)?,
        content_type: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        last_error: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        updated_at: from_millis(row.get(10)?),
        next_retry_at: from_millis(row.get(11)?),
    })
}

// ==========================================
// Inbox
// ==========================================

const INBOX_COLUMNS: &str = "id, message_id, queue_name, routing_key, payload, content_type, retry_count, max_retries, last_error, delivery_tag, created_at, updated_at, next_retry_at";

/// Insert an inbox message unless one with the same message id exists.
pub fn insert_inbox_message(
    conn: &Connection,
    message: &NewInboxMessage,
    now: DateTime<Utc>,
) -> DatabaseResult<InboxInsert> {
    let result = conn.execute(
        "INSERT INTO inbox (message_id, queue_name, routing_key, payload, content_type, retry_count, max_retries, last_error, delivery_tag, created_at, updated_at, next_retry_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
        params![
            message.message_id,
            message.queue_name,
            message.routing_key,
            message.payload,
            message.content_type,
            message.retry_count,
            message.max_retries,
            message.last_error,
            message.delivery_tag as i64,
            to_millis(now),
            to_millis(message.next_retry_at),
        ],
    );

    match result.map_err(DatabaseError::from) {
        Ok(_) => Ok(InboxInsert::Inserted(conn.last_insert_rowid())),
        Err(e) if e.is_unique_violation() => {
            debug!(message_id = %message.message_id, "Inbox message already present");
            Ok(InboxInsert::Duplicate)
        }
        Err(e) => Err(e),
    }
}

/// Claim up to `limit` due inbox rows for `owner` until `lease_until`.
pub fn claim_due_inbox_messages(
    conn: &Connection,
    owner: &str,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<InboxMessage>> {
    let sql = claim_sql(QueueSide::Inbox, INBOX_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt
        .query_map(
            params![owner, to_millis(lease_until), to_millis(now), limit as i64],
            inbox_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by_key(|m| (m.next_retry_at, m.id));
    Ok(rows)
}

/// Get an inbox message by id.
pub fn get_inbox_message(conn: &Connection, id: i64) -> DatabaseResult<Option<InboxMessage>> {
    let sql = format!("SELECT {INBOX_COLUMNS} FROM inbox WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    match stmt.query_row(params![id], inbox_from_row) {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List every inbox row in queue order.
pub fn list_inbox_messages(conn: &Connection) -> DatabaseResult<Vec<InboxMessage>> {
    let sql = format!("SELECT {INBOX_COLUMNS} FROM inbox ORDER BY id ASC");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([], inbox_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn inbox_from_row(row: &Row<'_>) -> rusqlite::Result<InboxMessage> {
    Ok(InboxMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        queue_name: row.get(2)?,
        routing_key: row.get(3)?,
        payload: row.get(4)?,
        content_type: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        last_error: row.get(8)?,
        delivery_tag: row.get::<_, i64>(9)? as u64,
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
        next_retry_at: from_millis(row.get(12)?),
    })
}

// ==========================================
// Settling claimed rows (both queues)
// ==========================================

/// Delete a delivered row. Returns false if `owner` no longer holds it.
pub fn delete_queue_message(
    conn: &Connection,
    side: QueueSide,
    id: i64,
    owner: &str,
) -> DatabaseResult<bool> {
    let sql = format!(
        "DELETE FROM {} WHERE id = ?1 AND locked_by = ?2",
        side.table()
    );
    let count = conn.execute(&sql, params![id, owner])?;
    Ok(count > 0)
}

/// Record a failed attempt and release the lease.
///
/// Returns false if `owner` no longer holds the row.
#[allow(clippy::too_many_arguments)]
pub fn reschedule_queue_message(
    conn: &Connection,
    side: QueueSide,
    id: i64,
    owner: &str,
    retry_count: i32,
    last_error: &str,
    next_retry_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let sql = format!(
        "UPDATE {}
         SET retry_count = ?1, last_error = ?2, next_retry_at = ?3, updated_at = ?4,
             locked_by = NULL, locked_until = NULL
         WHERE id = ?5 AND locked_by = ?6",
        side.table()
    );
    let count = conn.execute(
        &sql,
        params![
            retry_count,
            last_error,
            to_millis(next_retry_at),
            to_millis(now),
            id,
            owner
        ],
    )?;
    Ok(count > 0)
}

/// Move a row into `dead_letters` and delete it, atomically.
///
/// Returns false if `owner` no longer holds the row.
#[allow(clippy::too_many_arguments)]
pub fn abandon_queue_message(
    conn: &Connection,
    side: QueueSide,
    id: i64,
    owner: &str,
    retry_count: i32,
    last_error: &str,
    reason: AbandonReason,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let (message_id_column, exchange_column) = match side {
        QueueSide::Outbox => ("NULL", "exchange_name"),
        QueueSide::Inbox => ("message_id", "''"),
    };
    let table = side.table();
    let copy_sql = format!(
        "INSERT INTO dead_letters (side, source_id, message_id, queue_name, exchange_name, routing_key, payload, content_type, retry_count, last_error, reason, created_at, abandoned_at)
         SELECT ?1, id, {message_id_column}, queue_name, {exchange_column}, routing_key, payload, content_type, ?2, ?3, ?4, created_at, ?5
         FROM {table}
         WHERE id = ?6 AND locked_by = ?7"
    );

    let tx = conn.unchecked_transaction()?;
    let copied = tx.execute(
        &copy_sql,
        params![
            side.as_str(),
            retry_count,
            last_error,
            reason.as_str(),
            to_millis(now),
            id,
            owner
        ],
    )?;
    if copied == 0 {
        return Ok(false);
    }
    tx.execute(
        &format!("DELETE FROM {table} WHERE id = ?1 AND locked_by = ?2"),
        params![id, owner],
    )?;
    tx.commit()?;
    Ok(true)
}

// ==========================================
// Dead letters and depths
// ==========================================

/// List dead letters, optionally restricted to one side, oldest first.
pub fn list_dead_letters(
    conn: &Connection,
    side: Option<QueueSide>,
) -> DatabaseResult<Vec<DeadLetter>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, side, source_id, message_id, queue_name, exchange_name, routing_key, payload, content_type, retry_count, last_error, reason, created_at, abandoned_at
         FROM dead_letters
         WHERE ?1 IS NULL OR side = ?1
         ORDER BY id ASC",
    )?;
    let letters = stmt
        .query_map(params![side.map(|s| s.as_str())], |row| {
            Ok(DeadLetter {
                id: row.get(0)?,
                side: QueueSide::from_str(&row.get::<_, String>(1)?),
                source_id: row.get(2)?,
                message_id: row.get(3)?,
                queue_name: row.get(4)?,
                exchange_name: row.get(5)?,
                routing_key: row.get(6)?,
                payload: row.get(7)?,
                content_type: row.get(8)?,
                retry_count: row.get(9)?,
                last_error: row.get(10)?,
                reason: AbandonReason::from_str(&row.get::<_, String>(11)?),
                created_at: from_millis(row.get(12)?),
                abandoned_at: from_millis(row.get(13)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(letters)
}

/// Count rows in the outbox, inbox, and dead-letter tables.
pub fn queue_depths(conn: &Connection) -> DatabaseResult<QueueDepths> {
    let depths = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM outbox), (SELECT COUNT(*) FROM inbox), (SELECT COUNT(*) FROM dead_letters)",
        [],
        |row| {
            Ok(QueueDepths {
                outbox: row.get(0)?,
                inbox: row.get(1)?,
                dead_letters: row.get(2)?,
            })
        },
    )?;
    Ok(depths)
}

// ==========================================
// Helpers
// ==========================================

fn claim_sql(side: QueueSide, columns: &str) -> String {
    let table = side.table();
    format!(
        "UPDATE {table} SET locked_by = ?1, locked_until = ?2
         WHERE id IN (
             SELECT id FROM {table}
             WHERE next_retry_at <= ?3
               AND retry_count < max_retries
               AND (locked_until IS NULL OR locked_until <= ?3)
             ORDER BY next_retry_at ASC, id ASC
             LIMIT ?4
         )
         RETURNING {columns}"
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn currency_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Currency> {
    let raw: String = row.get(idx)?;
    Currency::parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
