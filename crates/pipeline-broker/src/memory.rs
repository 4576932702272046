//! In-process broker.
//!
//! Behaves like a single AMQP node with manual acknowledgement: unacked
//! deliveries are redelivered when their consumer goes away, `nack(true)`
//! requeues, `nack(false)` dead-letters. Publishes can be made to fail on
//! demand.

use crate::{
    Acknowledger, Broker, BrokerError, BrokerResult, ConsumeOptions, Delivery, DeliveryStream,
    Publishing, QueueOptions,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Per-consumer channel capacity. Messages beyond it wait in the queue.
const CONSUMER_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content_type: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    consumer: Option<mpsc::Sender<Delivery>>,
    auto_ack: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), Vec<String>>,
    published: Vec<Publishing>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    dead_lettered: Vec<StoredMessage>,
}

struct Inner {
    state: Mutex<State>,
    available: AtomicBool,
    publish_failures: AtomicUsize,
    next_tag: AtomicU64,
    acker: Arc<dyn Acknowledger>,
}

struct MemoryAcker {
    inner: Weak<Inner>,
}

/// Process-local [`Broker`].
///
/// Cloning is cheap; clones share queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            publish_failures: AtomicUsize::new(0),
            next_tag: AtomicU64::new(1),
            acker: Arc::new(MemoryAcker {
                inner: weak.clone(),
            }),
        });
        Self { inner }
    }

    /// Bind a declared queue to a named exchange under `routing_key`.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let bound = state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Toggle whether the broker accepts publishes at all.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Drop the consumer of `queue`, returning its unacked deliveries to the queue.
    pub fn disconnect_consumer(&self, queue: &str) {
        let mut state = self.inner.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumer = None;
            requeue_unacked(q);
        }
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<Publishing> {
        self.inner.state.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.inner.state.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.inner.state.lock().nacked.clone()
    }

    /// Bodies rejected without requeue.
    pub fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .dead_lettered
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages handed out and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.options.clone())
    }

    fn route(state: &State, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                return vec![routing_key.to_string()];
            }
            return Vec::new();
        }
        state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, options: &QueueOptions) -> BrokerResult<()> {
        let mut state = self.inner.state.lock();
        state
            .queues
            .entry(options.name.clone())
            .or_insert_with(|| QueueState {
                options: options.clone(),
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                consumer: None,
                auto_ack: false,
            });
        debug!(queue = %options.name, "Declared queue");
        Ok(())
    }

    async fn publish(&self, publishing: &Publishing) -> BrokerResult<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker is not accepting publishes".into()));
        }
        let injected = self
            .inner
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Unavailable("injected publish failure".into()));
        }

        let mut state = self.inner.state.lock();
        let targets = Self::route(&state, &publishing.exchange, &publishing.routing_key);
        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: publishing.exchange.clone(),
                routing_key: publishing.routing_key.clone(),
            });
        }

        state.published.push(publishing.clone());
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    exchange: publishing.exchange.clone(),
                    routing_key: publishing.routing_key.clone(),
                    content_type: publishing.content_type.clone(),
                    body: publishing.body.clone(),
                    redelivered: false,
                });
                dispatch(queue, &self.inner.next_tag, &self.inner.acker);
            }
        }
        Ok(())
    }

    async fn consume(&self, options: &ConsumeOptions) -> BrokerResult<DeliveryStream> {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let mut state = self.inner.state.lock();
        let queue = state
            .queues
            .get_mut(&options.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(options.queue.clone()))?;

        requeue_unacked(queue);
        queue.consumer = Some(tx);
        queue.auto_ack = options.auto_ack;
        dispatch(queue, &self.inner.next_tag, &self.inner.acker);

        debug!(queue = %options.queue, consumer_tag = %options.consumer_tag, "Consumer attached");
        Ok(DeliveryStream::new(rx))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let inner = self.upgrade()?;
        let mut state = inner.state.lock();
        let queue = take_unacked(&mut state, delivery_tag)?;
        state.acked.push(delivery_tag);
        if let Some(q) = state.queues.get_mut(&queue) {
            dispatch(q, &inner.next_tag, &inner.acker);
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let inner = self.upgrade()?;
        let mut state = inner.state.lock();
        let queue = take_unacked_message(&mut state, delivery_tag)?;
        state.nacked.push((delivery_tag, requeue));
        let (name, mut message) = queue;
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&name) {
                q.ready.push_back(message);
                dispatch(q, &inner.next_tag, &inner.acker);
            }
        } else {
            state.dead_lettered.push(message);
        }
        Ok(())
    }
}

impl MemoryAcker {
    fn upgrade(&self) -> BrokerResult<Arc<Inner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| BrokerError::Unavailable("broker was dropped".into()))
    }
}

fn take_unacked(state: &mut State, delivery_tag: u64) -> BrokerResult<String> {
    take_unacked_message(state, delivery_tag).map(|(name, _)| name)
}

fn take_unacked_message(
    state: &mut State,
    delivery_tag: u64,
) -> BrokerResult<(String, StoredMessage)> {
    state
        .queues
        .iter_mut()
        .find_map(|(name, q)| q.unacked.remove(&delivery_tag).map(|m| (name.clone(), m)))
        .ok_or_else(|| BrokerError::Protocol(format!("unknown delivery tag {delivery_tag}")))
}

fn requeue_unacked(queue: &mut QueueState) {
    let mut pending: Vec<(u64, StoredMessage)> = queue.unacked.drain().collect();
    pending.sort_by_key(|(tag, _)| *tag);
    for (_, mut message) in pending.into_iter().rev() {
        message.redelivered = true;
        queue.ready.push_front(message);
    }
}

/// Hand ready messages to the consumer until it is full or the queue is empty.
fn dispatch(queue: &mut QueueState, next_tag: &AtomicU64, acker: &Arc<dyn Acknowledger>) {
    let Some(consumer) = queue.consumer.clone() else {
        return;
    };
    while let Some(message) = queue.ready.pop_front() {
        let tag = next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery::new(
            tag,
            message.exchange.clone(),
            message.routing_key.clone(),
            message.content_type.clone(),
            message.body.clone(),
            message.redelivered,
            Arc::clone(acker),
        );
        match consumer.try_send(delivery) {
            Ok(()) => {
                if !queue.auto_ack {
                    queue.unacked.insert(tag, message);
                }
            }
            Err(TrySendError::Full(_)) => {
                queue.ready.push_front(message);
                break;
            }
            Err(TrySendError::Closed(_)) => {
                queue.ready.push_front(message);
                queue.consumer = None;
                requeue_unacked(queue);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "oms.order.created";

    fn publishing(body: &[u8]) -> Publishing {
        Publishing {
            exchange: String::new(),
            routing_key: QUEUE.to_string(),
            content_type: "application/json".to_string(),
            body: body.to_vec(),
        }
    }

    fn consume_options() -> ConsumeOptions {
        ConsumeOptions {
            queue: QUEUE.to_string(),
            consumer_tag: "test".to_string(),
            auto_ack: false,
        }
    }

    async fn broker_with_queue() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueOptions::new(QUEUE)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let broker = broker_with_queue().await;
        broker.publish(&publishing(b"one")).await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), 1);

        let mut stream = broker.consume(&consume_options()).await.unwrap();
        let delivery = stream.recv().await.unwrap();
        assert_eq!(delivery.body, b"one");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(QUEUE), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.acked(), vec![delivery.delivery_tag]);
    }

    #[tokio::test]
    async fn test_unroutable_publish_fails() {
        let broker = InMemoryBroker::new();
        let result = broker.publish(&publishing(b"x")).await;
        assert!(matches!(result, Err(BrokerError::Unroutable { .. })));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_named_exchange_routes_through_bindings() {
        let broker = broker_with_queue().await;
        broker.bind_queue(QUEUE, "oms", "order.created").unwrap();

        let mut message = publishing(b"routed");
        message.exchange = "oms".to_string();
        message.routing_key = "order.created".to_string();
        broker.publish(&message).await.unwrap();
        assert_eq!(broker.ready_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_then_recovery() {
        let broker = broker_with_queue().await;
        broker.fail_next_publishes(2);

        assert!(broker.publish(&publishing(b"a")).await.is_err());
        assert!(broker.publish(&publishing(b"b")).await.is_err());
        broker.publish(&publishing(b"c")).await.unwrap();

        broker.set_available(false);
        assert!(matches!(
            broker.publish(&publishing(b"d")).await,
            Err(BrokerError::Unavailable(_))
        ));
        broker.set_available(true);
        broker.publish(&publishing(b"e")).await.unwrap();

        let bodies: Vec<_> = broker.published().into_iter().map(|p| p.body).collect();
        assert_eq!(bodies, vec![b"c".to_vec(), b"e".to_vec()]);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = broker_with_queue().await;
        let mut stream = broker.consume(&consume_options()).await.unwrap();
        broker.publish(&publishing(b"retry-me")).await.unwrap();

        let first = stream.recv().await.unwrap();
        first.nack(true).await.unwrap();

        let second = stream.recv().await.unwrap();
        assert_eq!(second.body, b"retry-me");
        assert!(second.redelivered);
        assert_ne!(second.delivery_tag, first.delivery_tag);
        assert_eq!(broker.nacked(), vec![(first.delivery_tag, true)]);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = broker_with_queue().await;
        let mut stream = broker.consume(&consume_options()).await.unwrap();
        broker.publish(&publishing(b"garbage")).await.unwrap();

        let delivery = stream.recv().await.unwrap();
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.dead_lettered(), vec![b"garbage".to_vec()]);
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_disconnect_redelivers_unacked() {
        let broker = broker_with_queue().await;
        broker.publish(&publishing(b"in-flight")).await.unwrap();

        let mut stream = broker.consume(&consume_options()).await.unwrap();
        let lost = stream.recv().await.unwrap();
        broker.disconnect_consumer(QUEUE);
        drop(lost);
        assert_eq!(broker.ready_count(QUEUE), 1);

        let mut stream = broker.consume(&consume_options()).await.unwrap();
        let again = stream.recv().await.unwrap();
        assert_eq!(again.body, b"in-flight");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_consume_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.consume(&consume_options()).await,
            Err(BrokerError::QueueNotFound(_))
        ));
    }
}
