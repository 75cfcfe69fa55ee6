//! Counter storage for rate limit windows.

mod memory;
mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A per-key hit counter within one fixed window.
///
/// Records are owned by the store; callers only ever receive a snapshot taken
/// at the moment of an `increment` or `get` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// Identity key this record counts hits for.
    pub key: String,
    /// Hits observed in the current window, including the hit that opened it.
    pub hit_count: u64,
    /// When the current window expires, in milliseconds since the epoch.
    pub window_reset_at: i64,
}

/// Trait for counter store implementations.
///
/// This trait abstracts over the process-local `InMemoryStore` and the
/// shared `RedisStore` so the middleware can work with either. Additional
/// backends only need these two methods.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit for `key` within a fixed window of length `window`.
    ///
    /// If no record exists for the key, or the existing record's window has
    /// expired, a fresh window starts with `hit_count = 1`. Otherwise the
    /// count is incremented and the reset time is left untouched. The update
    /// is atomic per key; two concurrent increments never observe the same
    /// pre-increment state.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord>;

    /// Read-only snapshot of the current record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<WindowRecord>>;
}

/// Source of the current wall-clock time in epoch milliseconds.
///
/// Stores take a clock so window expiry can be driven deterministically in
/// tests; production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time from the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
///
/// Primarily useful for testing window expiry without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Create a clock pinned at `now_ms`.
    pub fn starting_at(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_record_serde_round_trip() {
        let record = WindowRecord {
            key: "10.0.0.1".to_string(),
            hit_count: 17,
            window_reset_at: 1_700_000_060_000,
        };

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: WindowRecord = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.hit_count, 17);
        assert_eq!(decoded.window_reset_at, 1_700_000_060_000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
    }
}
