//! Retry and backoff policy shared by the coordinator, the intake, and both relays.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Largest exponent applied to the base delay. Keeps the shift well inside `i64`.
const MAX_BACKOFF_EXPONENT: i32 = 20;

/// Largest base delay a loaded config may carry.
pub const MAX_BASE_DELAY_SECS: u64 = 86_400;

/// Exponential backoff policy for durable queue rows.
///
/// A row that has failed `n` times is next due at `failed_at + base_delay * 2^n`,
/// so the delays run 60s, 120s, 240s, ... after the first, second, third failure.
/// Freshly enqueued rows (`n = 0`) are due one base delay after creation.
///
/// A row whose retry count reaches `max_retries` is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Attempts allowed before a row is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_retries() -> i32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of a row that now has `retry_count` failures.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, MAX_BACKOFF_EXPONENT) as u32;
        let base = i64::try_from(self.base_delay_secs).unwrap_or(i64::MAX);
        Duration::try_seconds(base.saturating_mul(1_i64 << exponent)).unwrap_or(Duration::MAX)
    }

    /// Due time for a row that just failed and now carries `retry_count`.
    pub fn next_retry_at(&self, failed_at: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        failed_at
            .checked_add_signed(self.backoff(retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Due time for a row that is being enqueued for the first time.
    pub fn first_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_retry_at(now, 0)
    }

    /// Whether a row carrying `retry_count` failures must be abandoned.
    pub fn is_exhausted(&self, retry_count: i32, max_retries: i32) -> bool {
        retry_count >= max_retries
    }
}
