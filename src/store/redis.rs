//! Redis-backed counter store for counters shared across instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::trace;

use super::{Clock, CounterStore, SystemClock, WindowRecord};
use crate::error::{GatelimitError, Result};

/// Default prefix applied to every Redis key.
pub const DEFAULT_KEY_PREFIX: &str = "gatelimit:";

/// Default budget for a single Redis round trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(1);

/// Executed atomically by Redis: count the hit, start the window TTL on the
/// first hit of a window, and report the remaining window time. Expired keys
/// are reclaimed by Redis itself, so there is no sweep on this path.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {count, ttl}
"#;

/// Counter store backed by a shared Redis instance.
///
/// Multiple service instances pointed at the same Redis observe the same
/// counters, so quotas hold across a fleet. Atomicity per key comes from the
/// single-threaded execution of the increment script inside Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
    operation_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatelimitError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GatelimitError::StoreUnavailable(e.to_string()))?;

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            clock: Arc::new(SystemClock),
        })
    }

    /// Override the key prefix, isolating several limiters on one Redis.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the per-operation timeout.
    ///
    /// An operation that exceeds the budget fails with
    /// [`GatelimitError::StoreUnavailable`]; the middleware then applies its
    /// fail-open or fail-closed policy.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    fn redis_key(&self, key: &str) -> String {
        join_key(&self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord> {
        let mut conn = self.conn.clone();
        let redis_key = self.redis_key(key);
        let window_ms = window.as_millis() as i64;

        let mut invocation = self.script.key(&redis_key);
        invocation.arg(window_ms);

        let (hit_count, ttl_ms): (u64, i64) =
            tokio::time::timeout(self.operation_timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| {
                    GatelimitError::StoreUnavailable("increment timed out".to_string())
                })?
                .map_err(|e| GatelimitError::StoreUnavailable(e.to_string()))?;

        // PTTL reports a negative value only if the key lost its expiry;
        // treat that as a window that just started.
        let remaining_ms = if ttl_ms < 0 { window_ms } else { ttl_ms };
        let record = WindowRecord {
            key: key.to_string(),
            hit_count,
            window_reset_at: self.clock.now_ms() + remaining_ms,
        };

        trace!(
            key = %record.key,
            hits = record.hit_count,
            "Counted hit in shared store"
        );

        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<Option<WindowRecord>> {
        let mut conn = self.conn.clone();
        let redis_key = self.redis_key(key);

        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(&redis_key).cmd("PTTL").arg(&redis_key);

        let (hit_count, ttl_ms): (Option<u64>, i64) =
            tokio::time::timeout(self.operation_timeout, pipe.query_async(&mut conn))
                .await
                .map_err(|_| GatelimitError::StoreUnavailable("get timed out".to_string()))?
                .map_err(|e| GatelimitError::StoreUnavailable(e.to_string()))?;

        Ok(hit_count.map(|hit_count| WindowRecord {
            key: key.to_string(),
            hit_count,
            window_reset_at: self.clock.now_ms() + ttl_ms.max(0),
        }))
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_joins_prefix_and_identity() {
        assert_eq!(join_key(DEFAULT_KEY_PREFIX, "10.0.0.1"), "gatelimit:10.0.0.1");
        assert_eq!(join_key("api:", "user:42"), "api:user:42");
        assert_eq!(join_key("", "k"), "k");
    }

    #[test]
    fn test_increment_script_sets_expiry_once() {
        // The script must only arm the TTL on the hit that opens the window,
        // so later hits inside the window cannot push the reset time out.
        let body = INCREMENT_SCRIPT;
        assert!(body.contains("INCR"));
        assert_eq!(body.matches("PEXPIRE").count(), 1);
        assert!(body.contains("if count == 1"));
    }
}
