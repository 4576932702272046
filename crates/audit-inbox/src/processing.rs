//! Turning order events into audit records.

use crate::ProcessingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_database::{queries, AuditLogOrder, DatabasePool};
use serde::Deserialize;
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Sink for audit records, one record per call.
#[async_trait]
pub trait AuditProcessor: Send + Sync {
    async fn process(&self, log: &AuditLogOrder) -> Result<(), ProcessingError>;
}

/// Writes audit records to the `audit_log_order` table.
#[derive(Clone)]
pub struct AuditLogService {
    pool: DatabasePool,
}

impl AuditLogService {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, order_id: Option<i64>) -> Result<Vec<AuditLogOrder>, ProcessingError> {
        let logs = self
            .pool
            .call(move |conn| queries::list_audit_logs(conn, order_id))
            .await?;
        Ok(logs)
    }
}

#[async_trait]
impl AuditProcessor for AuditLogService {
    async fn process(&self, log: &AuditLogOrder) -> Result<(), ProcessingError> {
        let log = log.clone();
        let ids = self
            .pool
            .call(move |conn| queries::save_audit_logs(conn, std::slice::from_ref(&log)))
            .await?;
        debug!(audit_id = ids.first().copied().unwrap_or_default(), "Audit record saved");
        Ok(())
    }
}

/// What the consumer reads from an order event.
///
/// Prices, currencies and product details are producer concerns and are
/// ignored, so a new currency upstream cannot make an event unreadable here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub id: i64,
    pub customer_id: i64,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub order_items: Vec<OrderEventItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OrderEventItem {
    pub id: i64,
}

impl OrderEvent {
    pub fn audit_records(&self, now: DateTime<Utc>) -> Vec<AuditLogOrder> {
        AuditLogOrder::for_items(
            self.id,
            self.customer_id,
            self.order_items.iter().map(|item| item.id),
            now,
        )
    }
}

/// Decode an order event body.
///
/// The body must be a JSON object; only `id`, `customerId` and the item ids
/// are required.
pub fn decode_order(body: &[u8]) -> Result<OrderEvent, ProcessingError> {
    let raw: &RawValue =
        serde_json::from_slice(body).map_err(|e| ProcessingError::Malformed(e.to_string()))?;
    if !raw.get().starts_with('{') {
        return Err(ProcessingError::Malformed(
            "order event is not a JSON object".to_string(),
        ));
    }
    serde_json::from_str(raw.get()).map_err(|e| ProcessingError::Malformed(e.to_string()))
}

/// Write one audit record per line item, stopping at the first failure.
///
/// Returns the number of records written.
pub async fn process_order(
    processor: &dyn AuditProcessor,
    order: &OrderEvent,
    now: DateTime<Utc>,
) -> Result<usize, ProcessingError> {
    let logs = order.audit_records(now);
    for log in &logs {
        processor.process(log).await?;
    }
    Ok(logs.len())
}

/// Idempotency key of a delivery: lowercase hex SHA-256 of the raw body.
pub fn message_id_for(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}
