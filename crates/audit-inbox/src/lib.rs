//! Audit Inbox
//!
//! Consumer side of the order pipeline:
//! - [`MessageIntake`] consumes order events and writes audit records
//! - [`InboxStore`] parks events whose processing failed
//! - [`InboxRelay`] replays parked events until they succeed or are abandoned

mod error;
mod intake;
mod processing;
mod relay;
mod store;

pub use error::{InboxError, InboxResult, ProcessingError};
pub use intake::{DeliveryOutcome, IntakeHandle, MessageIntake};
pub use processing::{
    decode_order, message_id_for, process_order, AuditLogService, AuditProcessor, OrderEvent,
    OrderEventItem,
};
pub use relay::{inbox_relay, InboxRelay, InboxReplayer};
pub use store::InboxStore;
