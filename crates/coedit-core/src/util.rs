//! Shared utility functions used across multiple modules.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Source of "now" for presence bookkeeping.
///
/// Production code uses the system clock; tests drive a manual clock so TTL
/// expiry can be exercised without sleeping.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    /// A manual clock starting at `start_millis`.
    pub fn manual(start_millis: i64) -> Self {
        Self::Manual(Arc::new(AtomicI64::new(start_millis)))
    }

    /// Current time in Unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        match self {
            Self::System => unix_millis_now(),
            Self::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Self::Manual(now) = self {
            now.fetch_add(duration_millis(by), Ordering::SeqCst);
        }
    }
}
