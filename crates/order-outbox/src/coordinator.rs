//! Transactional order creation.
//!
//! Orders and their audit events are made durable together: inside one unit
//! of work the coordinator inserts the batch, publishes one audit event per
//! order, and falls back to an outbox row for every publish the broker
//! refuses. The batch commits only when each order is either published or
//! queued.

use crate::{OutboxError, OutboxResult, OutboxRoute};
use chrono::Utc;
use pipeline_broker::{Broker, BrokerError, Publishing};
use pipeline_config_and_utils::RetryPolicy;
use pipeline_database::{queries, DatabasePool, NewOrder, Order, OrderQuery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound on one synchronous publish. The batch's write lock is held
/// while it runs.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How an order's audit event left the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDispatch {
    /// The broker accepted the event synchronously.
    Published,
    /// The broker refused it; the outbox relay owns it now.
    Queued { outbox_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderDispatch {
    pub order_id: i64,
    pub dispatch: AuditDispatch,
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchInsertReport {
    pub orders: Vec<Order>,
    pub dispatch: Vec<OrderDispatch>,
}

impl BatchInsertReport {
    pub fn queued(&self) -> usize {
        self.dispatch
            .iter()
            .filter(|d| matches!(d.dispatch, AuditDispatch::Queued { .. }))
            .count()
    }
}

pub struct ProducerTransactionCoordinator {
    pool: DatabasePool,
    broker: Arc<dyn Broker>,
    route: OutboxRoute,
    policy: RetryPolicy,
    publish_timeout: Duration,
}

impl ProducerTransactionCoordinator {
    /// Build a coordinator and declare its destination queue.
    pub async fn new(
        pool: DatabasePool,
        broker: Arc<dyn Broker>,
        route: OutboxRoute,
        policy: RetryPolicy,
    ) -> OutboxResult<Self> {
        broker.declare_queue(&route.queue).await?;
        info!(queue = %route.queue.name, exchange = %route.exchange, "Audit destination declared");
        Ok(Self {
            pool,
            broker,
            route,
            policy,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        })
    }

    /// Publishes slower than `timeout` are treated as failed and queued.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    async fn publish(&self, publishing: &Publishing) -> Result<(), BrokerError> {
        match tokio::time::timeout(self.publish_timeout, self.broker.publish(publishing)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Unavailable(format!(
                "publish timed out after {}ms",
                self.publish_timeout.as_millis()
            ))),
        }
    }

    /// Create a batch of orders.
    ///
    /// On error nothing from the batch is committed.
    pub async fn create_orders(&self, orders: Vec<NewOrder>) -> OutboxResult<BatchInsertReport> {
        if orders.is_empty() {
            return Ok(BatchInsertReport::default());
        }

        let uow = self.pool.begin().await?;
        // Dropping `uow` on any early return rolls the batch back.
        let created = uow
            .call(move |conn| queries::bulk_insert_orders(conn, &orders, Utc::now()))
            .await?;

        let mut dispatch = Vec::with_capacity(created.len());
        for order in &created {
            let order_id = order.id;
            let body = serde_json::to_vec(order).map_err(|e| {
                error!(order_id, error = %e, "Failed to serialize audit event, rolling back batch");
                OutboxError::from(e)
            })?;
            let publishing = self.route.publishing(body);

            let publish_error = match self.publish(&publishing).await {
                Ok(()) => {
                    info!(order_id, routing_key = %publishing.routing_key, "Audit event published");
                    dispatch.push(OrderDispatch {
                        order_id,
                        dispatch: AuditDispatch::Published,
                    });
                    continue;
                }
                Err(e) => e,
            };

            warn!(order_id, error = %publish_error, "Publish failed, queueing audit event in outbox");
            let message = self.route.outbox_message(
                publishing.body,
                publish_error.to_string(),
                &self.policy,
                Utc::now(),
            );
            let next_retry_at = message.next_retry_at;
            let inserted = uow
                .call(move |conn| queries::insert_outbox_message(conn, &message, Utc::now()))
                .await;
            match inserted {
                Ok(outbox_id) => {
                    info!(
                        order_id,
                        outbox_id,
                        next_retry_at = %next_retry_at,
                        "Audit event queued in outbox"
                    );
                    dispatch.push(OrderDispatch {
                        order_id,
                        dispatch: AuditDispatch::Queued { outbox_id },
                    });
                }
                Err(e) => {
                    error!(order_id, error = %e, "Failed to queue audit event, rolling back batch");
                    if let Err(rollback_error) = uow.rollback().await {
                        error!(error = %rollback_error, "Rollback failed");
                    }
                    return Err(OutboxError::Undeliverable {
                        order_id,
                        source: e,
                    });
                }
            }
        }

        uow.commit().await?;

        let report = BatchInsertReport {
            orders: created,
            dispatch,
        };
        info!(
            orders = report.orders.len(),
            queued = report.queued(),
            "Order batch committed"
        );
        Ok(report)
    }

    pub async fn get_orders(&self, query: OrderQuery) -> OutboxResult<Vec<Order>> {
        let orders = self
            .pool
            .call(move |conn| queries::query_orders(conn, &query))
            .await?;
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_broker::{InMemoryBroker, QueueOptions};
    use pipeline_database::{Currency, NewOrderItem, PoolConfig};
    use tempfile::{tempdir, TempDir};

    const QUEUE: &str = "oms.order.created";

    fn new_order(customer_id: i64, items: usize) -> NewOrder {
        NewOrder {
            customer_id,
            delivery_address: "Moscow, Tverskaya 1".to_string(),
            total_price_cents: 1000 * items as i64,
            total_price_currency: Currency::Rub,
            order_items: (0..items)
                .map(|i| NewOrderItem {
                    product_id: 100 + i as i64,
                    quantity: 1,
                    product_title: format!("Product {i}"),
                    product_url: String::new(),
                    price_cents: 1000,
                    price_currency: Currency::Rub,
                })
                .collect(),
        }
    }

    async fn setup() -> (TempDir, DatabasePool, InMemoryBroker, ProducerTransactionCoordinator) {
        let dir = tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        let broker = InMemoryBroker::new();
        let coordinator = ProducerTransactionCoordinator::new(
            pool.clone(),
            Arc::new(broker.clone()),
            OutboxRoute::to_queue(QueueOptions::new(QUEUE)),
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        (dir, pool, broker, coordinator)
    }

    #[tokio::test]
    async fn test_create_orders_publishes_events() {
        let (_dir, pool, broker, coordinator) = setup().await;

        let report = coordinator
            .create_orders(vec![new_order(1, 2), new_order(2, 1)])
            .await
            .unwrap();

        assert_eq!(report.orders.len(), 2);
        assert_eq!(report.queued(), 0);
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.ready_count(QUEUE), 2);

        let event: Order = serde_json::from_slice(&broker.published()[0].body).unwrap();
        assert_eq!(event.id, report.orders[0].id);
        assert_eq!(event.order_items.len(), 2);

        let depths = pool.call(queries::queue_depths).await.unwrap();
        assert_eq!(depths.outbox, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_queues_in_outbox_and_commits() {
        let (_dir, pool, broker, coordinator) = setup().await;
        broker.fail_next_publishes(1);

        let before = Utc::now();
        let report = coordinator
            .create_orders(vec![new_order(1, 1), new_order(2, 1)])
            .await
            .unwrap();

        let first = report.orders[0].id;
        let AuditDispatch::Queued { outbox_id } = report.dispatch[0].dispatch else {
            panic!("first order should have been queued");
        };
        assert_eq!(report.dispatch[0].order_id, first);
        assert_eq!(report.dispatch[1].dispatch, AuditDispatch::Published);

        let row = pool
            .call(move |conn| queries::get_outbox_message(conn, outbox_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.max_retries, 5);
        assert!(row.last_error.unwrap().contains("injected publish failure"));
        assert!(row.next_retry_at >= before + chrono::Duration::seconds(30));
        let event: Order = serde_json::from_slice(&row.payload).unwrap();
        assert_eq!(event.id, first);

        let stored = coordinator.get_orders(OrderQuery::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_outbox_failure_rolls_back_batch() {
        let (_dir, pool, broker, coordinator) = setup().await;
        broker.set_available(false);
        pool.call(|conn| Ok(conn.execute_batch("DROP TABLE outbox")?))
            .await
            .unwrap();

        let result = coordinator.create_orders(vec![new_order(1, 3)]).await;
        assert!(matches!(result, Err(OutboxError::Undeliverable { .. })));

        let count: i64 = pool
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM orders) + (SELECT COUNT(*) FROM order_items)",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    /// Accepts declarations but never finishes a publish.
    struct StalledBroker(InMemoryBroker);

    #[async_trait::async_trait]
    impl Broker for StalledBroker {
        async fn declare_queue(&self, options: &QueueOptions) -> pipeline_broker::BrokerResult<()> {
            self.0.declare_queue(options).await
        }

        async fn publish(&self, _publishing: &Publishing) -> pipeline_broker::BrokerResult<()> {
            std::future::pending().await
        }

        async fn consume(
            &self,
            options: &pipeline_broker::ConsumeOptions,
        ) -> pipeline_broker::BrokerResult<pipeline_broker::DeliveryStream> {
            self.0.consume(options).await
        }
    }

    #[tokio::test]
    async fn test_stalled_publish_times_out_into_outbox() {
        let dir = tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        let coordinator = ProducerTransactionCoordinator::new(
            pool.clone(),
            Arc::new(StalledBroker(InMemoryBroker::new())),
            OutboxRoute::to_queue(QueueOptions::new(QUEUE)),
            RetryPolicy::default(),
        )
        .await
        .unwrap()
        .with_publish_timeout(Duration::from_millis(50));

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.create_orders(vec![new_order(1, 1)]),
        )
        .await
        .expect("batch should finish once the publish times out")
        .unwrap();
        assert_eq!(report.queued(), 1);

        let rows = pool.call(queries::list_outbox_messages).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].last_error.as_deref().unwrap().contains("timed out"));

        // The write lock was released with the commit.
        let uow = pool.begin().await.unwrap();
        uow.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (_dir, _pool, broker, coordinator) = setup().await;
        let report = coordinator.create_orders(Vec::new()).await.unwrap();
        assert!(report.orders.is_empty());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_get_orders_by_customer() {
        let (_dir, _pool, _broker, coordinator) = setup().await;
        coordinator
            .create_orders(vec![new_order(1, 1), new_order(2, 2), new_order(1, 0)])
            .await
            .unwrap();

        let orders = coordinator
            .get_orders(OrderQuery {
                customer_ids: vec![2],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_items.len(), 2);
    }
}
