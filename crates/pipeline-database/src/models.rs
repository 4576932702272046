//! Model types for database entities.

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status written on every audit row derived from a freshly created order.
pub const ORDER_STATUS_CREATED: &str = "created";

/// Content type of serialized order events.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// ==========================================
// Orders
// ==========================================

/// Currency of a price. Rubles are the only supported currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[default]
    #[serde(rename = "RUB")]
    Rub,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rub => "RUB",
        }
    }

    pub fn parse(s: &str) -> DatabaseResult<Self> {
        match s {
            "RUB" => Ok(Self::Rub),
            other => Err(DatabaseError::InvalidData(format!(
                "unsupported currency: {other}"
            ))),
        }
    }
}

/// An order aggregate with its line items.
///
/// This is also the wire shape of the order-created audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub total_price_cents: i64,
    #[serde(default)]
    pub total_price_currency: Currency,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub order_items: Vec<OrderItem>,
}

/// A single order line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: i64,
    #[serde(default)]
    pub order_id: i64,
    #[serde(default)]
    pub product_id: i64,
    #[serde(default)]
    pub quantity: i32,
    #[serde(default)]
    pub product_title: String,
    #[serde(default)]
    pub product_url: String,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub price_currency: Currency,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub customer_id: i64,
    pub delivery_address: String,
    pub total_price_cents: i64,
    #[serde(default)]
    pub total_price_currency: Currency,
    #[serde(default)]
    pub order_items: Vec<NewOrderItem>,
}

/// Input for creating an order line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub product_id: i64,
    pub quantity: i32,
    pub product_title: String,
    #[serde(default)]
    pub product_url: String,
    pub price_cents: i64,
    #[serde(default)]
    pub price_currency: Currency,
}

/// Filter for reading orders. Empty id lists match everything.
#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub ids: Vec<i64>,
    pub customer_ids: Vec<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ==========================================
// Audit log
// ==========================================

/// One audit record per order line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogOrder {
    /// Zero until persisted.
    pub id: i64,
    pub order_id: i64,
    pub order_item_id: i64,
    pub customer_id: i64,
    pub order_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuditLogOrder {
    /// One unsaved record per line item of an order, in item order.
    pub fn for_items(
        order_id: i64,
        customer_id: i64,
        item_ids: impl IntoIterator<Item = i64>,
        now: DateTime<Utc>,
    ) -> Vec<Self> {
        item_ids
            .into_iter()
            .map(|order_item_id| Self {
                id: 0,
                order_id,
                order_item_id,
                customer_id,
                order_status: ORDER_STATUS_CREATED.to_string(),
                created_at: now,
                updated_at: now,
            })
            .collect()
    }
}

// ==========================================
// Durable queues
// ==========================================

/// Producer-side queued audit event that still has to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: i64,
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

/// Input for enqueuing an outbox message.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
}

/// Consumer-side delivery whose processing failed and is awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    pub id: i64,
    /// SHA-256 of the payload, unique per table.
    pub message_id: String,
    pub queue_name: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub delivery_tag: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

/// Input for inserting an inbox message.
#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub message_id: String,
    pub queue_name: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub delivery_tag: u64,
    pub next_retry_at: DateTime<Utc>,
}

/// Result of inserting an inbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxInsert {
    Inserted(i64),
    /// A row with the same message id already exists.
    Duplicate,
}

/// Which durable queue a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSide {
    Outbox,
    Inbox,
}

impl QueueSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Inbox => "inbox",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "inbox" => Self::Inbox,
            _ => Self::Outbox,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        self.as_str()
    }
}

/// Why a row left its queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbandonReason {
    /// Failed as many times as it was allowed to.
    RetriesExhausted,
    /// The payload could not be decoded.
    Malformed,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Malformed => "malformed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "malformed" => Self::Malformed,
            _ => Self::RetriesExhausted,
        }
    }
}

/// Terminal record of an abandoned queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: i64,
    pub side: QueueSide,
    pub source_id: i64,
    pub message_id: Option<String>,
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub reason: AbandonReason,
    pub created_at: DateTime<Utc>,
    pub abandoned_at: DateTime<Utc>,
}

/// Row counts across the queue tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub outbox: i64,
    pub inbox: i64,
    pub dead_letters: i64,
}
