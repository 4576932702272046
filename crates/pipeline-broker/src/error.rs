//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker cannot be reached
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// No queue is bound to the exchange and routing key
    #[error("No queue bound for exchange '{exchange}' and routing key '{routing_key}'")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Queue has not been declared
    #[error("Queue not declared: {0}")]
    QueueNotFound(String),

    /// Delivery was already acknowledged or rejected
    #[error("Delivery {0} already settled")]
    AlreadySettled(u64),

    /// Protocol error (unexpected reply shape)
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
