//! Storage seam for relays.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pipeline_database::{AbandonReason, DatabaseResult, InboxMessage, OutboxMessage};

/// Row shape every durable retry queue shares.
pub trait QueuedMessage: Send + Sync + 'static {
    fn id(&self) -> i64;
    fn retry_count(&self) -> i32;
    fn max_retries(&self) -> i32;
    fn next_retry_at(&self) -> DateTime<Utc>;
}

impl QueuedMessage for OutboxMessage {
    fn id(&self) -> i64 {
        self.id
    }

    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }
}

impl QueuedMessage for InboxMessage {
    fn id(&self) -> i64 {
        self.id
    }

    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }
}

/// Durable queue a relay drains.
///
/// Rows are claimed under an owner token; the settle operations only apply
/// while that owner still holds the row and report `false` otherwise.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    type Message: QueuedMessage;

    /// Claim up to `limit` due rows, oldest-due first.
    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> DatabaseResult<Vec<Self::Message>>;

    /// Remove a delivered row.
    async fn delete(&self, message: &Self::Message, owner: &str) -> DatabaseResult<bool>;

    /// Record a failed attempt and schedule the next one.
    async fn reschedule(
        &self,
        message: &Self::Message,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DatabaseResult<bool>;

    /// Remove a row for good, keeping a dead-letter copy.
    async fn abandon(
        &self,
        message: &Self::Message,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        reason: AbandonReason,
    ) -> DatabaseResult<bool>;
}

#[async_trait]
impl<T: QueueStore> QueueStore for std::sync::Arc<T> {
    type Message = T::Message;

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> DatabaseResult<Vec<Self::Message>> {
        (**self).claim_due(owner, now, lease, limit).await
    }

    async fn delete(&self, message: &Self::Message, owner: &str) -> DatabaseResult<bool> {
        (**self).delete(message, owner).await
    }

    async fn reschedule(
        &self,
        message: &Self::Message,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        (**self)
            .reschedule(message, owner, retry_count, last_error, next_retry_at)
            .await
    }

    async fn abandon(
        &self,
        message: &Self::Message,
        owner: &str,
        retry_count: i32,
        last_error: &str,
        reason: AbandonReason,
    ) -> DatabaseResult<bool> {
        (**self)
            .abandon(message, owner, retry_count, last_error, reason)
            .await
    }
}
