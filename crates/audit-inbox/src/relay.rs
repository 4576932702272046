use crate::processing::{decode_order, process_order};
use crate::{AuditProcessor, InboxStore};
use async_trait::async_trait;
use chrono::Utc;
use pipeline_config_and_utils::{RelayConfig, RetryPolicy};
use pipeline_database::InboxMessage;
use retriable_relay::{AttemptError, Relay, RelayHandler};
use std::sync::Arc;
use tracing::debug;

/// Re-runs audit processing for parked order events.
pub struct InboxReplayer {
    processor: Arc<dyn AuditProcessor>,
}

impl InboxReplayer {
    pub fn new(processor: Arc<dyn AuditProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl RelayHandler for InboxReplayer {
    type Message = InboxMessage;

    async fn attempt(&self, message: &InboxMessage) -> Result<(), AttemptError> {
        let order = decode_order(&message.payload)
            .map_err(|e| AttemptError::Malformed(e.to_string()))?;
        let audit_rows = process_order(self.processor.as_ref(), &order, Utc::now())
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;
        debug!(inbox_id = message.id, order_id = order.id, audit_rows, "Inbox replay succeeded");
        Ok(())
    }
}

pub type InboxRelay = Relay<InboxStore, InboxReplayer>;

pub fn inbox_relay(
    store: InboxStore,
    processor: Arc<dyn AuditProcessor>,
    policy: RetryPolicy,
    config: RelayConfig,
) -> InboxRelay {
    Relay::new("inbox", store, InboxReplayer::new(processor), policy, config)
}
