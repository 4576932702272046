//! Consumer-side error types.

use pipeline_broker::BrokerError;
use pipeline_database::DatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub type InboxResult<T> = Result<T, InboxError>;

/// Why an order event could not be turned into audit records.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The body is not an order event. Retrying cannot fix it.
    #[error("malformed order event: {0}")]
    Malformed(String),

    #[error("audit write failed: {0}")]
    Storage(#[from] DatabaseError),

    /// The audit sink refused the record.
    #[error("audit record rejected: {0}")]
    Rejected(String),
}

impl ProcessingError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
