use thiserror::Error;

/// Failures while loading, validating or saving [`crate::Config`].
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
