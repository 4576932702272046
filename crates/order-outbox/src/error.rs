//! Producer-side error types.

use pipeline_broker::BrokerError;
use pipeline_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker refused the event and the outbox insert failed too.
    #[error("Audit event for order {order_id} could be neither published nor queued: {source}")]
    Undeliverable {
        order_id: i64,
        #[source]
        source: DatabaseError,
    },
}

pub type OutboxResult<T> = Result<T, OutboxError>;
