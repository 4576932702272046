//! Unit of work: one SQLite transaction pinned to one pooled connection.

use crate::pool::spawn_blocking;
use crate::DatabaseResult;
use parking_lot::Mutex;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::warn;

type PinnedConnection = Arc<Mutex<PooledConnection<SqliteConnectionManager>>>;

/// A transaction held open across several repository calls.
///
/// Started with `BEGIN IMMEDIATE` so the write lock is taken up front. Every
/// statement, including `COMMIT` and `ROLLBACK`, runs on tokio's blocking
/// pool. Dropping an unfinished unit of work rolls it back before the
/// connection returns to the pool.
pub struct UnitOfWork {
    conn: PinnedConnection,
    finished: bool,
}

impl UnitOfWork {
    pub(crate) fn begin(conn: PooledConnection<SqliteConnectionManager>) -> DatabaseResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            finished: false,
        })
    }

    /// Run `f` inside this transaction.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || f(&conn.lock())).await
    }

    /// Commit the transaction.
    ///
    /// On failure the transaction is rolled back when the unit of work drops.
    pub async fn commit(mut self) -> DatabaseResult<()> {
        self.call(|conn| Ok(conn.execute_batch("COMMIT")?)).await?;
        self.finished = true;
        Ok(())
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> DatabaseResult<()> {
        self.finished = true;
        self.call(|conn| Ok(conn.execute_batch("ROLLBACK")?)).await
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let conn = Arc::clone(&self.conn);
        let rollback = move || {
            if let Err(e) = conn.lock().execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned unit of work");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            }
            Err(_) => rollback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{DatabaseError, DatabasePool, DatabaseResult, PoolConfig};
    use std::time::Duration;

    fn count_orders(pool: &DatabasePool) -> i64 {
        pool.get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap()
    }

    fn insert_order(conn: &rusqlite::Connection) -> DatabaseResult<()> {
        conn.execute(
            "INSERT INTO orders (customer_id, delivery_address, total_price_cents, total_price_currency, created_at, updated_at)
             VALUES (1, 'addr', 100, 'RUB', 'now', 'now')",
            [],
        )?;
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("uow.db"), PoolConfig::default()).unwrap();

        let uow = pool.begin().await.unwrap();
        uow.call(insert_order).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(count_orders(&pool), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("uow.db"), PoolConfig::default()).unwrap();

        let uow = pool.begin().await.unwrap();
        uow.call(insert_order).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(count_orders(&pool), 0);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("uow.db"), PoolConfig::default()).unwrap();

        {
            let uow = pool.begin().await.unwrap();
            uow.call(insert_order).await.unwrap();
        }

        assert_eq!(count_orders(&pool), 0);

        // The write lock is released once the rollback lands.
        let uow = pool.begin().await.unwrap();
        uow.call(insert_order).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(count_orders(&pool), 1);
    }

    #[tokio::test]
    async fn test_statement_errors_keep_transaction_open() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("uow.db"), PoolConfig::default()).unwrap();

        let uow = pool.begin().await.unwrap();
        uow.call(insert_order).await.unwrap();
        let failed = uow
            .call(|conn| Ok(conn.execute_batch("INSERT INTO missing_table VALUES (1)")?))
            .await;
        assert!(matches!(failed, Err(DatabaseError::Sqlite(_))));
        uow.commit().await.unwrap();

        assert_eq!(count_orders(&pool), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_open_transaction_does_not_block_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("uow.db"), PoolConfig::default()).unwrap();

        let uow = pool.begin().await.unwrap();
        // A statement that sleeps on the connection must leave the single
        // runtime thread free for other tasks.
        let started = std::time::Instant::now();
        let slow = uow.call(|conn| {
            std::thread::sleep(Duration::from_millis(500));
            insert_order(conn)
        });
        let ticker = async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            started.elapsed()
        };
        let (slow, ticked_after) = tokio::join!(slow, ticker);
        slow.unwrap();
        assert!(ticked_after < Duration::from_millis(400));
        uow.commit().await.unwrap();
        assert_eq!(count_orders(&pool), 1);
    }
}
