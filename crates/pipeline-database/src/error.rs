use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The pool could not hand out a connection in time.
    #[error("connection pool: {0}")]
    Connection(String),

    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),

    /// A stored column held a value the model cannot represent.
    #[error("unexpected stored value: {0}")]
    InvalidData(String),

    #[error("blocking database task failed: {0}")]
    Task(String),
}

impl DatabaseError {
    /// True for `UNIQUE` constraint failures, e.g. a second inbox row for
    /// the same `message_id`.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
