use crate::OutboxStore;
use async_trait::async_trait;
use pipeline_broker::{Broker, Publishing};
use pipeline_config_and_utils::{RelayConfig, RetryPolicy};
use pipeline_database::OutboxMessage;
use retriable_relay::{AttemptError, Relay, RelayHandler};
use std::sync::Arc;

/// Republishes queued audit events exactly as they were first routed.
pub struct OutboxPublisher {
    broker: Arc<dyn Broker>,
}

impl OutboxPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl RelayHandler for OutboxPublisher {
    type Message = OutboxMessage;

    async fn attempt(&self, message: &OutboxMessage) -> Result<(), AttemptError> {
        let publishing = Publishing {
            exchange: message.exchange_name.clone(),
            routing_key: message.routing_key.clone(),
            content_type: message.content_type.clone(),
            body: message.payload.clone(),
        };
        self.broker
            .publish(&publishing)
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))
    }
}

pub type OutboxRelay = Relay<OutboxStore, OutboxPublisher>;

pub fn outbox_relay(
    store: OutboxStore,
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    config: RelayConfig,
) -> OutboxRelay {
    Relay::new("outbox", store, OutboxPublisher::new(broker), policy, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use pipeline_broker::{InMemoryBroker, QueueOptions};
    use pipeline_database::{AbandonReason, DatabasePool, NewOutboxMessage, PoolConfig};
    use tempfile::{tempdir, TempDir};

    const QUEUE: &str = "oms.order.created";

    async fn setup() -> (TempDir, OutboxStore, InMemoryBroker, OutboxRelay) {
        let dir = tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueOptions::new(QUEUE)).await.unwrap();
        let store = OutboxStore::new(pool);
        let relay = outbox_relay(
            store.clone(),
            Arc::new(broker.clone()),
            RetryPolicy::default(),
            RelayConfig::default(),
        );
        (dir, store, broker, relay)
    }

    async fn enqueue(
        store: &OutboxStore,
        body: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    ) -> i64 {
        store
            .enqueue(NewOutboxMessage {
                queue_name: QUEUE.to_string(),
                exchange_name: String::new(),
                routing_key: QUEUE.to_string(),
                payload: body.as_bytes().to_vec(),
                content_type: "application/json".to_string(),
                retry_count,
                max_retries: 5,
                last_error: None,
                next_retry_at,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_publishes_and_deletes() {
        let (_dir, store, broker, relay) = setup().await;
        let id = enqueue(&store, r#"{"id":1}"#, 0, Utc::now() - Duration::seconds(1)).await;

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(store.get(id).await.unwrap().is_none());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, QUEUE);
        assert_eq!(published[0].body, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_failed_publish_backs_off() {
        let (_dir, store, broker, relay) = setup().await;
        let id = enqueue(&store, r#"{"id":1}"#, 2, Utc::now() - Duration::seconds(1)).await;
        broker.set_available(false);

        let before = Utc::now();
        relay.run_once().await.unwrap();
        let after = Utc::now();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 3);
        assert!(row.last_error.is_some());
        // Stored with millisecond precision.
        assert!(row.next_retry_at >= before + Duration::seconds(240) - Duration::milliseconds(1));
        assert!(row.next_retry_at <= after + Duration::seconds(240));
    }

    #[tokio::test]
    async fn test_exhausted_row_is_dead_lettered() {
        let (_dir, store, broker, relay) = setup().await;
        let id = enqueue(&store, r#"{"id":1}"#, 4, Utc::now() - Duration::seconds(1)).await;
        broker.set_available(false);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(store.get(id).await.unwrap().is_none());

        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, AbandonReason::RetriesExhausted);
        assert_eq!(dead[0].retry_count, 5);

        broker.set_available(true);
        assert_eq!(relay.run_once().await.unwrap().claimed, 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_limits_cycle() {
        let (_dir, store, broker, _relay) = setup().await;
        let relay = outbox_relay(
            store.clone(),
            Arc::new(broker.clone()),
            RetryPolicy::default(),
            RelayConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        let now = Utc::now();
        enqueue(&store, r#"{"id":3}"#, 0, now - Duration::seconds(10)).await;
        enqueue(&store, r#"{"id":1}"#, 0, now - Duration::seconds(30)).await;
        enqueue(&store, r#"{"id":2}"#, 0, now - Duration::seconds(20)).await;

        relay.run_once().await.unwrap();
        let bodies: Vec<Vec<u8>> = broker.published().into_iter().map(|p| p.body).collect();
        assert_eq!(bodies, vec![br#"{"id":1}"#.to_vec(), br#"{"id":2}"#.to_vec()]);

        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
