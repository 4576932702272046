//! The relay loop.

use crate::{AttemptError, QueueStore, QueuedMessage, RelayResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_config_and_utils::{RelayConfig, RetryPolicy};
use pipeline_database::AbandonReason;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Side-specific action a relay retries for each queued row.
#[async_trait]
pub trait RelayHandler: Send + Sync + 'static {
    type Message: QueuedMessage;

    async fn attempt(&self, message: &Self::Message) -> Result<(), AttemptError>;
}

/// What happens to a row after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reschedule {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    Abandon {
        retry_count: i32,
        reason: AbandonReason,
    },
}

/// Decide the fate of a row that failed at `failed_at` while carrying `retry_count`.
pub fn disposition_after_failure(
    policy: &RetryPolicy,
    retry_count: i32,
    max_retries: i32,
    error: &AttemptError,
    failed_at: DateTime<Utc>,
) -> Disposition {
    let retry_count = retry_count.saturating_add(1);
    if policy.is_exhausted(retry_count, max_retries) {
        let reason = match error {
            AttemptError::Malformed(_) => AbandonReason::Malformed,
            AttemptError::Transient(_) => AbandonReason::RetriesExhausted,
        };
        Disposition::Abandon {
            retry_count,
            reason,
        }
    } else {
        Disposition::Reschedule {
            retry_count,
            next_retry_at: policy.next_retry_at(failed_at, retry_count),
        }
    }
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// Rows whose settle step failed or whose lease was lost.
    pub unsettled: usize,
}

enum RowOutcome {
    Delivered,
    Rescheduled,
    Abandoned,
    Unsettled,
}

/// Background poller that drains one durable queue.
///
/// Each cycle claims up to `batch_size` due rows and attempts them one at a
/// time, in due order. A cycle that has started always runs to completion.
pub struct Relay<S, H> {
    name: &'static str,
    store: S,
    handler: H,
    policy: RetryPolicy,
    config: RelayConfig,
    owner: String,
}

impl<S, H> Relay<S, H>
where
    S: QueueStore,
    H: RelayHandler<Message = S::Message>,
{
    pub fn new(
        name: &'static str,
        store: S,
        handler: H,
        policy: RetryPolicy,
        config: RelayConfig,
    ) -> Self {
        Self {
            name,
            store,
            handler,
            policy,
            config,
            owner: format!("{name}-{}", Uuid::new_v4()),
        }
    }

    /// Lease owner token of this relay instance.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a single poll cycle.
    pub async fn run_once(&self) -> RelayResult<CycleReport> {
        let claimed = self
            .store
            .claim_due(
                &self.owner,
                Utc::now(),
                self.config.lease(),
                self.config.batch_size,
            )
            .await?;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            debug!(relay = self.name, "No due messages");
            return Ok(report);
        }

        info!(relay = self.name, count = claimed.len(), "Processing queued messages");

        for message in &claimed {
            match self.process(message).await {
                RowOutcome::Delivered => report.delivered += 1,
                RowOutcome::Rescheduled => report.rescheduled += 1,
                RowOutcome::Abandoned => report.abandoned += 1,
                RowOutcome::Unsettled => report.unsettled += 1,
            }
        }

        Ok(report)
    }

    async fn process(&self, message: &S::Message) -> RowOutcome {
        let id = message.id();
        let error = match self.handler.attempt(message).await {
            Ok(()) => {
                return match self.store.delete(message, &self.owner).await {
                    Ok(true) => {
                        info!(relay = self.name, id, "Message delivered and removed from queue");
                        RowOutcome::Delivered
                    }
                    Ok(false) => {
                        warn!(relay = self.name, id, "Message delivered but lease was lost before removal");
                        RowOutcome::Unsettled
                    }
                    Err(e) => {
                        error!(relay = self.name, id, error = %e, "Failed to remove delivered message");
                        RowOutcome::Unsettled
                    }
                };
            }
            Err(error) => error,
        };

        let last_error = error.to_string();
        match disposition_after_failure(
            &self.policy,
            message.retry_count(),
            message.max_retries(),
            &error,
            Utc::now(),
        ) {
            Disposition::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                match self
                    .store
                    .reschedule(message, &self.owner, retry_count, &last_error, next_retry_at)
                    .await
                {
                    Ok(true) => {
                        warn!(
                            relay = self.name,
                            id,
                            retry_count,
                            next_retry_at = %next_retry_at,
                            error = %last_error,
                            "Attempt failed, will retry"
                        );
                        RowOutcome::Rescheduled
                    }
                    Ok(false) => {
                        warn!(relay = self.name, id, "Lease lost before rescheduling");
                        RowOutcome::Unsettled
                    }
                    Err(e) => {
                        error!(relay = self.name, id, error = %e, "Failed to reschedule message");
                        RowOutcome::Unsettled
                    }
                }
            }
            Disposition::Abandon {
                retry_count,
                reason,
            } => {
                match self
                    .store
                    .abandon(message, &self.owner, retry_count, &last_error, reason)
                    .await
                {
                    Ok(true) => {
                        let data_loss = reason == AbandonReason::RetriesExhausted;
                        error!(
                            relay = self.name,
                            id,
                            retry_count,
                            reason = reason.as_str(),
                            data_loss,
                            error = %last_error,
                            "Message abandoned and moved to dead letters"
                        );
                        RowOutcome::Abandoned
                    }
                    Ok(false) => {
                        warn!(relay = self.name, id, "Lease lost before abandoning");
                        RowOutcome::Unsettled
                    }
                    Err(e) => {
                        error!(relay = self.name, id, error = %e, "Failed to abandon message");
                        RowOutcome::Unsettled
                    }
                }
            }
        }
    }

    /// Poll until `cancel` fires. The first poll happens one interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.poll_interval();
        info!(
            relay = self.name,
            owner = %self.owner,
            poll_interval_secs = period.as_secs(),
            batch_size = self.config.batch_size,
            "Relay started"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(relay = self.name, error = %e, "Poll cycle failed");
                    }
                }
            }
        }

        info!(relay = self.name, "Relay stopped");
    }

    /// Run the relay on its own task.
    ///
    /// The relay stops when `cancel` fires or [`RelayHandle::stop`] is called.
    pub fn spawn(self, cancel: &CancellationToken) -> RelayHandle {
        let token = cancel.child_token();
        let name = self.name;
        let task_token = token.clone();
        let join = tokio::spawn(async move { self.run(task_token).await });
        RelayHandle { name, token, join }
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Ask the relay to stop after its current cycle.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop the relay and wait up to `timeout` for it to finish.
    ///
    /// Returns false if the relay did not stop in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.stop();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(relay = self.name, error = %e, "Relay task failed");
                true
            }
            Err(_) => {
                warn!(relay = self.name, timeout_secs = timeout.as_secs(), "Relay did not stop in time");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use pipeline_database::DatabaseResult;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Row {
        id: i64,
        retry_count: i32,
        max_retries: i32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
        locked_by: Option<String>,
    }

    impl QueuedMessage for Row {
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

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<Vec<Row>>,
        dead: Mutex<Vec<(i64, i32, AbandonReason)>>,
    }

    impl FakeStore {
        fn with_rows(rows: &[(i64, i32, DateTime<Utc>)]) -> Arc<Self> {
            let store = Self::default();
            for (id, retry_count, next_retry_at) in rows {
                store.rows.lock().push(Row {
                    id: *id,
                    retry_count: *retry_count,
                    max_retries: 5,
                    next_retry_at: *next_retry_at,
                    last_error: None,
                    locked_by: None,
                });
            }
            Arc::new(store)
        }

        fn row(&self, id: i64) -> Option<Row> {
            self.rows.lock().iter().find(|r| r.id == id).cloned()
        }
    }

    #[async_trait]
    impl QueueStore for FakeStore {
        type Message = Row;

        async fn claim_due(
            &self,
            owner: &str,
            now: DateTime<Utc>,
            _lease: ChronoDuration,
            limit: usize,
        ) -> DatabaseResult<Vec<Row>> {
            let mut rows = self.rows.lock();
            let mut due: Vec<&mut Row> = rows
                .iter_mut()
                .filter(|r| {
                    r.next_retry_at <= now && r.retry_count < r.max_retries && r.locked_by.is_none()
                })
                .collect();
            due.sort_by_key(|r| (r.next_retry_at, r.id));
            Ok(due
                .into_iter()
                .take(limit)
                .map(|r| {
                    r.locked_by = Some(owner.to_string());
                    r.clone()
                })
                .collect())
        }

        async fn delete(&self, message: &Row, owner: &str) -> DatabaseResult<bool> {
            let mut rows = self.rows.lock();
            let before = rows.len();
            rows.retain(|r| !(r.id == message.id && r.locked_by.as_deref() == Some(owner)));
            Ok(rows.len() < before)
        }

        async fn reschedule(
            &self,
            message: &Row,
            owner: &str,
            retry_count: i32,
            last_error: &str,
            next_retry_at: DateTime<Utc>,
        ) -> DatabaseResult<bool> {
            let mut rows = self.rows.lock();
            let Some(row) = rows
                .iter_mut()
                .find(|r| r.id == message.id && r.locked_by.as_deref() == Some(owner))
            else {
                return Ok(false);
            };
            row.retry_count = retry_count;
            row.last_error = Some(last_error.to_string());
            row.next_retry_at = next_retry_at;
            row.locked_by = None;
            Ok(true)
        }

        async fn abandon(
            &self,
            message: &Row,
            owner: &str,
            retry_count: i32,
            _last_error: &str,
            reason: AbandonReason,
        ) -> DatabaseResult<bool> {
            let removed = self.delete(message, owner).await?;
            if removed {
                self.dead.lock().push((message.id, retry_count, reason));
            }
            Ok(removed)
        }
    }

    #[derive(Default, Clone)]
    struct ScriptedHandler {
        failures: Arc<Mutex<HashMap<i64, AttemptError>>>,
        attempts: Arc<Mutex<Vec<i64>>>,
    }

    impl ScriptedHandler {
        fn fail(&self, id: i64, error: AttemptError) {
            self.failures.lock().insert(id, error);
        }

        fn attempts(&self) -> Vec<i64> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl RelayHandler for ScriptedHandler {
        type Message = Row;

        async fn attempt(&self, message: &Row) -> Result<(), AttemptError> {
            self.attempts.lock().push(message.id);
            match self.failures.lock().get(&message.id) {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }
    }

    fn relay(
        store: Arc<FakeStore>,
        handler: ScriptedHandler,
        batch_size: usize,
    ) -> Relay<Arc<FakeStore>, ScriptedHandler> {
        Relay::new(
            "test",
            store,
            handler,
            RetryPolicy::default(),
            RelayConfig {
                poll_interval_secs: 10,
                batch_size,
                lease_secs: 60,
            },
        )
    }

    fn past(secs: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_disposition_reschedules_with_backoff() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();
        let disposition = disposition_after_failure(
            &policy,
            2,
            5,
            &AttemptError::Transient("down".into()),
            failed_at,
        );
        assert_eq!(
            disposition,
            Disposition::Reschedule {
                retry_count: 3,
                next_retry_at: failed_at + ChronoDuration::seconds(240),
            }
        );
    }

    #[test]
    fn test_disposition_abandons_at_threshold() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            disposition_after_failure(&policy, 4, 5, &AttemptError::Transient("x".into()), now),
            Disposition::Abandon {
                retry_count: 5,
                reason: AbandonReason::RetriesExhausted
            }
        );
        assert_eq!(
            disposition_after_failure(&policy, 4, 5, &AttemptError::Malformed("x".into()), now),
            Disposition::Abandon {
                retry_count: 5,
                reason: AbandonReason::Malformed
            }
        );
        assert!(matches!(
            disposition_after_failure(&policy, 1, 5, &AttemptError::Malformed("x".into()), now),
            Disposition::Reschedule { retry_count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_success_removes_row() {
        let store = FakeStore::with_rows(&[(1, 0, past(1))]);
        let relay = relay(store.clone(), ScriptedHandler::default(), 100);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 1);
        assert!(store.row(1).is_none());
    }

    #[tokio::test]
    async fn test_failure_updates_retry_state() {
        let store = FakeStore::with_rows(&[(1, 2, past(1))]);
        let handler = ScriptedHandler::default();
        handler.fail(1, AttemptError::Transient("connection refused".into()));
        let relay = relay(store.clone(), handler, 100);

        let before = Utc::now();
        let report = relay.run_once().await.unwrap();
        let after = Utc::now();

        assert_eq!(report.rescheduled, 1);
        let row = store.row(1).unwrap();
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.last_error.as_deref(), Some("connection refused"));
        assert!(row.next_retry_at >= before + ChronoDuration::seconds(240));
        assert!(row.next_retry_at <= after + ChronoDuration::seconds(240));

        // Not due yet, so the next cycle leaves it alone.
        assert_eq!(relay.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_row_is_abandoned_and_never_returns() {
        let store = FakeStore::with_rows(&[(1, 4, past(1))]);
        let handler = ScriptedHandler::default();
        handler.fail(1, AttemptError::Transient("audit rejected".into()));
        let relay = relay(store.clone(), handler.clone(), 100);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(store.row(1).is_none());
        assert_eq!(
            *store.dead.lock(),
            vec![(1, 5, AbandonReason::RetriesExhausted)]
        );

        assert_eq!(relay.run_once().await.unwrap().claimed, 0);
        assert_eq!(handler.attempts(), vec![1]);
    }

    #[tokio::test]
    async fn test_malformed_at_last_retry_is_deleted() {
        let store = FakeStore::with_rows(&[(1, 4, past(1))]);
        let handler = ScriptedHandler::default();
        handler.fail(1, AttemptError::Malformed("expected value".into()));
        let relay = relay(store.clone(), handler, 100);

        relay.run_once().await.unwrap();
        assert!(store.row(1).is_none());
        assert_eq!(*store.dead.lock(), vec![(1, 5, AbandonReason::Malformed)]);
    }

    #[tokio::test]
    async fn test_batch_takes_oldest_due_first() {
        let store = FakeStore::with_rows(&[(3, 0, past(10)), (1, 0, past(30)), (2, 0, past(20))]);
        let handler = ScriptedHandler::default();
        let relay = relay(store.clone(), handler.clone(), 2);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(handler.attempts(), vec![1, 2]);
        assert!(store.row(3).is_some());

        relay.run_once().await.unwrap();
        assert_eq!(handler.attempts(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let store = FakeStore::with_rows(&[(1, 0, past(3)), (2, 0, past(2)), (3, 0, past(1))]);
        let handler = ScriptedHandler::default();
        handler.fail(2, AttemptError::Transient("flaky".into()));
        let relay = relay(store.clone(), handler, 100);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(store.rows.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_relay_polls_and_stops_on_cancel() {
        let store = FakeStore::with_rows(&[(1, 0, past(1))]);
        let relay = relay(store.clone(), ScriptedHandler::default(), 100);
        let cancel = CancellationToken::new();
        let handle = relay.spawn(&cancel);

        // No poll before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.row(1).is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.row(1).is_none());

        cancel.cancel();
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop() {
        let store = FakeStore::with_rows(&[]);
        let relay = relay(store, ScriptedHandler::default(), 100);
        let cancel = CancellationToken::new();
        let handle = relay.spawn(&cancel);

        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert!(!cancel.is_cancelled());
    }
}
