//! Message broker seam for the order pipeline.
//!
//! The pipeline needs four broker operations: declare a queue, publish to an
//! exchange/routing key, consume a queue with manual acknowledgement, and
//! ack or nack each delivery. [`Broker`] captures them; two bindings exist:
//!
//! - [`RedisStreamsBroker`]: queues are Redis streams read through a consumer
//!   group; ack is `XACK`.
//! - [`InMemoryBroker`]: process-local queues with failure injection, used by
//!   tests and single-process runs.

mod delivery;
mod error;
mod memory;
mod redis_streams;

pub use delivery::{
    Acknowledger, Broker, ConsumeOptions, Delivery, DeliveryStream, Publishing, QueueOptions,
};
pub use error::{BrokerError, BrokerResult};
pub use memory::InMemoryBroker;
pub use redis_streams::{RedisBrokerConfig, RedisStreamsBroker};
