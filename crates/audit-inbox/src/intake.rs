//! Broker consumer for order events.
//!
//! Each delivery is decoded and turned into audit records on its own worker.
//! A delivery that cannot be processed is parked in the inbox and acknowledged,
//! so a stuck audit sink never blocks the queue; the inbox relay retries it
//! later. Undecodable deliveries are rejected without requeue.

use crate::processing::{decode_order, message_id_for, process_order};
use crate::{AuditProcessor, InboxResult, InboxStore};
use chrono::Utc;
use pipeline_broker::{Broker, BrokerResult, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use pipeline_config_and_utils::{InboxWriteFailurePolicy, IntakeConfig, RetryPolicy};
use pipeline_database::{InboxInsert, NewInboxMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the intake did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Audit records written, delivery acknowledged.
    Processed { audit_rows: usize },
    /// Undecodable body, delivery rejected without requeue.
    Rejected,
    /// Processing failed; parked in the inbox and acknowledged.
    Deferred { inbox_id: i64 },
    /// Processing failed and the inbox already holds this body; acknowledged.
    Duplicate,
    /// Processing failed and the inbox write failed too.
    InboxWriteFailed { requeued: bool },
}

/// Consumes order events and feeds them to an [`AuditProcessor`].
///
/// Cloning is cheap; clones share the same collaborators.
#[derive(Clone)]
pub struct MessageIntake {
    broker: Arc<dyn Broker>,
    processor: Arc<dyn AuditProcessor>,
    store: InboxStore,
    queue: QueueOptions,
    policy: RetryPolicy,
    config: Arc<IntakeConfig>,
}

impl MessageIntake {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<dyn AuditProcessor>,
        store: InboxStore,
        queue: QueueOptions,
        policy: RetryPolicy,
        config: IntakeConfig,
    ) -> Self {
        Self {
            broker,
            processor,
            store,
            queue,
            policy,
            config: Arc::new(config),
        }
    }

    /// Declare the source queue, start consuming, and run on a background task.
    pub async fn start(&self, cancel: &CancellationToken) -> InboxResult<IntakeHandle> {
        self.broker.declare_queue(&self.queue).await?;
        let stream = self
            .broker
            .consume(&ConsumeOptions {
                queue: self.queue.name.clone(),
                consumer_tag: self.config.consumer_tag.clone(),
                auto_ack: false,
            })
            .await?;

        info!(
            queue = %self.queue.name,
            consumer_tag = %self.config.consumer_tag,
            max_workers = self.config.max_workers,
            "Message intake started"
        );

        let token = cancel.child_token();
        let intake = self.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move { intake.run(stream, task_token).await });
        Ok(IntakeHandle { token, join })
    }

    /// Pull deliveries until `cancel` fires or the stream ends, then wait for
    /// in-flight workers.
    pub async fn run(&self, mut stream: DeliveryStream, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = stream.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!(queue = %self.queue.name, "Delivery stream closed");
                        break;
                    }
                },
            };

            let intake = self.clone();
            workers.spawn(async move {
                intake.handle_delivery(delivery).await;
                drop(permit);
            });

            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Intake worker panicked");
                }
            }
        }

        let in_flight = workers.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight deliveries");
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Intake worker panicked");
            }
        }
        info!(queue = %self.queue.name, "Message intake stopped");
    }

    /// Process and settle a single delivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let delivery_tag = delivery.delivery_tag;

        let order = match decode_order(&delivery.body) {
            Ok(order) => order,
            Err(e) => {
                error!(delivery_tag, error = %e, "Malformed order event, rejecting delivery");
                settle(delivery_tag, delivery.nack(false).await);
                return DeliveryOutcome::Rejected;
            }
        };

        let order_id = order.id;
        let processing_error =
            match process_order(self.processor.as_ref(), &order, Utc::now()).await {
                Ok(audit_rows) => {
                    settle(delivery_tag, delivery.ack().await);
                    info!(order_id, delivery_tag, audit_rows, "Order event processed");
                    return DeliveryOutcome::Processed { audit_rows };
                }
                Err(e) => e,
            };

        let message_id = message_id_for(&delivery.body);
        warn!(
            order_id,
            delivery_tag,
            message_id = %message_id,
            error = %processing_error,
            "Processing failed, deferring to inbox"
        );

        let failed_at = Utc::now();
        let message = NewInboxMessage {
            message_id: message_id.clone(),
            queue_name: self.queue.name.clone(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.body.clone(),
            content_type: delivery.content_type.clone(),
            retry_count: 0,
            max_retries: self.policy.max_retries,
            last_error: Some(processing_error.to_string()),
            delivery_tag,
            next_retry_at: self.policy.first_retry_at(failed_at),
        };

        match self.store.insert(message).await {
            Ok(InboxInsert::Inserted(inbox_id)) => {
                settle(delivery_tag, delivery.ack().await);
                info!(order_id, inbox_id, message_id = %message_id, "Order event parked in inbox");
                DeliveryOutcome::Deferred { inbox_id }
            }
            Ok(InboxInsert::Duplicate) => {
                settle(delivery_tag, delivery.ack().await);
                info!(order_id, message_id = %message_id, "Order event already in inbox");
                DeliveryOutcome::Duplicate
            }
            Err(e) => match self.config.on_inbox_write_failure {
                InboxWriteFailurePolicy::Acknowledge => {
                    error!(
                        order_id,
                        delivery_tag,
                        message_id = %message_id,
                        error = %e,
                        data_loss = true,
                        "Inbox write failed, acknowledging delivery; order event is lost"
                    );
                    settle(delivery_tag, delivery.ack().await);
                    DeliveryOutcome::InboxWriteFailed { requeued: false }
                }
                InboxWriteFailurePolicy::Requeue => {
                    error!(
                        order_id,
                        delivery_tag,
                        message_id = %message_id,
                        error = %e,
                        "Inbox write failed, returning delivery to the broker"
                    );
                    settle(delivery_tag, delivery.nack(true).await);
                    DeliveryOutcome::InboxWriteFailed { requeued: true }
                }
            },
        }
    }
}

fn settle(delivery_tag: u64, result: BrokerResult<()>) {
    match result {
        Ok(()) => debug!(delivery_tag, "Delivery settled"),
        Err(e) => error!(delivery_tag, error = %e, "Failed to settle delivery"),
    }
}

/// Handle to a running intake.
pub struct IntakeHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl IntakeHandle {
    /// Stop pulling deliveries. In-flight workers still finish.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait up to `timeout` for in-flight workers.
    ///
    /// Returns false if the intake did not drain in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.stop();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Intake task failed");
                true
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Intake did not drain in time");
                false
            }
        }
    }
}
