//! Shared SQLite pool.
//!
//! Every service in the pipeline talks to its database through one
//! [`DatabasePool`]. Blocking SQLite work is moved off the async runtime by
//! [`DatabasePool::call`]; [`DatabasePool::begin`] pins a connection for a
//! [`UnitOfWork`].

use crate::{migrations, DatabaseError, DatabaseResult, UnitOfWork};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Applied to every new connection. WAL lets the relays read while a
/// coordinator batch is writing.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

type SqlitePool = Pool<SqliteConnectionManager>;
type SqliteConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    /// How long `get` waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection counts, for the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Cloneable handle to the pipeline database.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
    path: Arc<str>,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path, config: PoolConfig) -> DatabaseResult<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            pool,
            path: Arc::from(path.to_string_lossy().as_ref()),
        };
        let conn = db.get()?;
        migrations::run_migrations(&conn)?;
        drop(conn);

        info!(path = %db.path, max_size = config.max_size, "Database opened");
        Ok(db)
    }

    /// Check out a connection, blocking up to the configured timeout.
    pub fn get(&self) -> DatabaseResult<SqliteConnection> {
        self.pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))
    }

    /// Run `f` on a pooled connection from tokio's blocking pool.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        spawn_blocking(move || f(&*db.get()?)).await
    }

    /// Start a unit of work on its own connection.
    pub async fn begin(&self) -> DatabaseResult<UnitOfWork> {
        let db = self.clone();
        spawn_blocking(move || UnitOfWork::begin(db.get()?)).await
    }

    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> DatabaseResult<()> {
        self.call(|conn| Ok(conn.execute_batch("SELECT 1")?)).await?;
        debug!(path = %self.path, "Database ping ok");
        Ok(())
    }
}

pub(crate) async fn spawn_blocking<T, F>(f: F) -> DatabaseResult<T>
where
    F: FnOnce() -> DatabaseResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::Task(e.to_string()))?
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}
