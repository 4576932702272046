//! Logging initialization for the pipeline services.

use crate::LogFormat;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set. Calling this more
/// than once keeps the first subscriber.
///
/// ```ignore
/// init_logging("info", LogFormat::Compact);
/// tracing::info!("Producer started");
/// ```
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(err) = result {
        eprintln!("Logging already initialized: {err}");
    }
}
