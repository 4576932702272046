//! Broker trait and the types that cross it.

use crate::{BrokerError, BrokerResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    /// Empty string is the default exchange, which routes by queue name.
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Consumer registration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: String,
    pub consumer_tag: String,
    /// When true, deliveries are settled by the broker as soon as they are handed out.
    pub auto_ack: bool,
}

/// Settles deliveries on behalf of a broker binding.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer.
///
/// Each delivery must be settled exactly once with [`Delivery::ack`] or
/// [`Delivery::nack`]; a second settlement returns [`BrokerError::AlreadySettled`].
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
    /// True when the broker has handed this message out before.
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_type: content_type.into(),
            body,
            redelivered,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Acknowledge the delivery, removing it from the broker.
    pub async fn ack(&self) -> BrokerResult<()> {
        self.mark_settled()?;
        self.acker.ack(self.delivery_tag).await
    }

    /// Reject the delivery. With `requeue` it is handed out again later;
    /// without, it is dropped or dead-lettered by the broker.
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.mark_settled()?;
        self.acker.nack(self.delivery_tag, requeue).await
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn mark_settled(&self) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("content_type", &self.content_type)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the broker side closes.
pub struct DeliveryStream {
    rx: mpsc::Receiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Operations the pipeline needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Declaring an existing queue is not an error.
    async fn declare_queue(&self, options: &QueueOptions) -> BrokerResult<()>;

    /// Publish a message. Returns once the broker has accepted it.
    async fn publish(&self, publishing: &Publishing) -> BrokerResult<()>;

    /// Start consuming a declared queue.
    async fn consume(&self, options: &ConsumeOptions) -> BrokerResult<DeliveryStream>;
}
