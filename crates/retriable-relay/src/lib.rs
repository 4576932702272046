//! Retriable Relay
//!
//! The shared poll, claim, attempt, and settle loop behind both the outbox
//! and the inbox. A [`Relay`] pairs a [`QueueStore`] with a [`RelayHandler`]
//! and drives rows through the [`RetryPolicy`](pipeline_config_and_utils::RetryPolicy)
//! until each one is delivered or abandoned.

mod error;
mod relay;
mod store;

pub use error::{AttemptError, RelayError, RelayResult};
pub use relay::{disposition_after_failure, CycleReport, Disposition, Relay, RelayHandle, RelayHandler};
pub use store::{QueueStore, QueuedMessage};
