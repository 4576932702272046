//! Relay error types.

use pipeline_database::DatabaseError;
use thiserror::Error;

/// Error that ends a poll cycle early.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Claiming due rows failed
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Why a single delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Infrastructure or business failure that may clear up later.
    #[error("{0}")]
    Transient(String),

    /// The payload itself cannot be decoded; retrying will not help.
    #[error("malformed payload: {0}")]
    Malformed(String),
}
