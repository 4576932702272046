//! Durable queue of audit events waiting to reach the broker.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pipeline_database::{
    queries, AbandonReason, DatabasePool, DatabaseResult, DeadLetter, NewOutboxMessage,
    OutboxMessage, QueueSide,
};
use retriable_relay::QueueStore;

/// Outbox table access.
///
/// Rows are inserted by the coordinator inside its unit of work; everything
/// after that belongs to the relay.
#[derive(Clone)]
pub struct OutboxStore {
    pool: DatabasePool,
}

impl OutboxStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Enqueue a message outside of any unit of work.
    pub async fn enqueue(&self, message: NewOutboxMessage) -> DatabaseResult<i64> {
        self.pool
            .call(move |conn| queries::insert_outbox_message(conn, &message, Utc::now()))
            .await
    }

    pub async fn get(&self, id: i64) -> DatabaseResult<Option<OutboxMessage>> {
        self.pool
            .call(move |conn| queries::get_outbox_message(conn, id))
            .await
    }

    pub async fn list(&self) -> DatabaseResult<Vec<OutboxMessage>> {
        self.pool.call(queries::list_outbox_messages).await
    }

    pub async fn dead_letters(&self) -> DatabaseResult<Vec<DeadLetter>> {
        self.pool
            .call(|conn| queries::list_dead_letters(conn, Some(QueueSide::Outbox)))
            .await
    }
}

#[async_trait]
impl QueueStore for OutboxStore {
    type Message = OutboxMessage;

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> DatabaseResult<Vec<OutboxMessage>> {
        let owner = owner.to_string();
        self.pool
            .call(move |conn| {
                queries::claim_due_outbox_messages(conn, &owner, now, now + lease, limit)
            })
            .await
    }

    async fn delete(&self, message: &OutboxMessage, owner: &str) -> DatabaseResult<bool> {
        let (id, owner) = (message.id, owner.to_string());
        self.pool
            .call(move |conn| queries::delete_queue_message(conn, QueueSide::Outbox, id, &owner))
            .await
    }

    async fn reschedule(
        &self,
        message: &OutboxMessage,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let (id, owner, last_error) = (message.id, owner.to_string(), last_error.to_string());
        self.pool
            .call(move |conn| {
                queries::reschedule_queue_message(
                    conn,
                    QueueSide::Outbox,
                    id,
                    &owner,
                    retry_count,
                    &last_error,
                    next_retry_at,
                    Utc::now(),
                )
            })
            .await
    }

    async fn abandon(
        &self,
        message: &OutboxMessage,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        reason: AbandonReason,
    ) -> DatabaseResult<bool> {
        let (id, owner, last_error) = (message.id, owner.to_string(), last_error.to_string());
        self.pool
            .call(move |conn| {
                queries::abandon_queue_message(
                    conn,
                    QueueSide::Outbox,
                    id,
                    &owner,
                    retry_count,
                    &last_error,
                    reason,
                    Utc::now(),
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_database::PoolConfig;
    use tempfile::tempdir;

    fn message(next_retry_at: DateTime<Utc>) -> NewOutboxMessage {
        NewOutboxMessage {
            queue_name: "oms.order.created".to_string(),
            exchange_name: String::new(),
            routing_key: "oms.order.created".to_string(),
            payload: br#"{"id":1}"#.to_vec(),
            content_type: "application/json".to_string(),
            retry_count: 0,
            max_retries: 5,
            last_error: Some("broker down".to_string()),
            next_retry_at,
        }
    }

    #[tokio::test]
    async fn test_claim_settle_cycle() {
        let dir = tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        let store = OutboxStore::new(pool);

        let now = Utc::now();
        let id = store.enqueue(message(now - Duration::seconds(1))).await.unwrap();
        store.enqueue(message(now + Duration::seconds(60))).await.unwrap();

        let claimed = store
            .claim_due("relay-a", now, Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        // Another owner cannot settle a row it does not hold.
        assert!(!store.delete(&claimed[0], "relay-b").await.unwrap());
        assert!(store.delete(&claimed[0], "relay-a").await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_moves_row_to_dead_letters() {
        let dir = tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        let store = OutboxStore::new(pool);

        let now = Utc::now();
        let id = store.enqueue(message(now - Duration::seconds(1))).await.unwrap();
        let claimed = store
            .claim_due("relay-a", now, Duration::seconds(60), 10)
            .await
            .unwrap();

        assert!(store
            .abandon(&claimed[0], "relay-a", 5, "still down", AbandonReason::RetriesExhausted)
            .await
            .unwrap());

        assert!(store.get(id).await.unwrap().is_none());
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].source_id, id);
        assert_eq!(dead[0].retry_count, 5);
        assert_eq!(dead[0].reason, AbandonReason::RetriesExhausted);
        assert_eq!(dead[0].last_error.as_deref(), Some("still down"));
    }
}
