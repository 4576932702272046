//! Order Outbox
//!
//! Producer side of the order pipeline:
//! - [`ProducerTransactionCoordinator`] creates orders and makes their audit
//!   events durable in the same unit of work
//! - [`OutboxStore`] is the durable queue of events the broker refused
//! - [`OutboxRelay`] drains that queue back to the broker

mod coordinator;
mod error;
mod relay;
mod route;
mod store;

pub use coordinator::{
    AuditDispatch, BatchInsertReport, OrderDispatch, ProducerTransactionCoordinator,
    DEFAULT_PUBLISH_TIMEOUT,
};
pub use error::{OutboxError, OutboxResult};
pub use relay::{outbox_relay, OutboxPublisher, OutboxRelay};
pub use route::OutboxRoute;
pub use store::OutboxStore;
