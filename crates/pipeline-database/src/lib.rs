//! SQLite persistence for the order pipeline.
//!
//! This crate provides:
//! - A connection pool with WAL mode and an async `call` helper
//! - Units of work pinned to one pooled connection (Begin/Commit/Rollback)
//! - Database migrations
//! - Model types for orders, audit rows, and the durable outbox/inbox queues
//! - Query helpers, including lease-based claiming of due queue rows
//!
//! ```ignore
//! let pool = DatabasePool::open(path, PoolConfig::default())?;
//! let uow = pool.begin().await?;
//! let orders = uow
//!     .call(move |conn| queries::bulk_insert_orders(conn, &new_orders, Utc::now()))
//!     .await?;
//! uow.commit().await?;
//! ```

mod error;
mod migrations;
mod models;
mod pool;
pub mod queries;
mod unit_of_work;

pub use error::{DatabaseError, DatabaseResult};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
pub use pool::{DatabasePool, PoolConfig, PoolState};
pub use unit_of_work::UnitOfWork;
