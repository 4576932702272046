//! Durable queue of order events whose processing failed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pipeline_database::{
    queries, AbandonReason, DatabasePool, DatabaseResult, DeadLetter, InboxInsert, InboxMessage,
    NewInboxMessage, QueueSide,
};
use retriable_relay::QueueStore;

/// Inbox table access. Inserts are idempotent on `message_id`.
#[derive(Clone)]
pub struct InboxStore {
    pool: DatabasePool,
}

impl InboxStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, message: NewInboxMessage) -> DatabaseResult<InboxInsert> {
        self.pool
            .call(move |conn| queries::insert_inbox_message(conn, &message, Utc::now()))
            .await
    }

    pub async fn get(&self, id: i64) -> DatabaseResult<Option<InboxMessage>> {
        self.pool
            .call(move |conn| queries::get_inbox_message(conn, id))
            .await
    }

    pub async fn list(&self) -> DatabaseResult<Vec<InboxMessage>> {
        self.pool.call(queries::list_inbox_messages).await
    }

    pub async fn dead_letters(&self) -> DatabaseResult<Vec<DeadLetter>> {
        self.pool
            .call(|conn| queries::list_dead_letters(conn, Some(QueueSide::Inbox)))
            .await
    }
}

#[async_trait]
impl QueueStore for InboxStore {
    type Message = InboxMessage;

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> DatabaseResult<Vec<InboxMessage>> {
        let owner = owner.to_string();
        self.pool
            .call(move |conn| {
                queries::claim_due_inbox_messages(conn, &owner, now, now + lease, limit)
            })
            .await
    }

    async fn delete(&self, message: &InboxMessage, owner: &str) -> DatabaseResult<bool> {
        let (id, owner) = (message.id, owner.to_string());
        self.pool
            .call(move |conn| queries::delete_queue_message(conn, QueueSide::Inbox, id, &owner))
            .await
    }

    async fn reschedule(
        &self,
        message: &InboxMessage,
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
                    QueueSide::Inbox,
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
        message: &InboxMessage,
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
                    QueueSide::Inbox,
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
