//! Process-local counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Clock, CounterStore, SystemClock, WindowRecord};
use crate::error::Result;

/// Default interval between sweeps of expired records.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Mutable per-key state. The key itself lives in the map.
struct WindowSlot {
    hit_count: u64,
    window_reset_at: i64,
}

/// In-process counter store backed by a concurrent map.
///
/// Per-key updates go through the map's entry API, so two concurrent
/// increments for the same key serialize on the entry's shard lock and no
/// update is lost. A background task sweeps expired records on a fixed
/// interval to bound memory growth; the sweep takes the same shard locks as
/// `increment`, so it can never remove a window that is being refreshed
/// concurrently.
///
/// Counters are local to this process. Deployments with multiple instances
/// that need shared quotas should use [`super::RedisStore`] instead.
pub struct InMemoryStore {
    slots: Arc<DashMap<String, WindowSlot>>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryStore {
    /// Create a store with the default sweep interval.
    ///
    /// Must be called within a tokio runtime; the sweep task is spawned
    /// immediately.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store whose sweep task fires every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let slots: Arc<DashMap<String, WindowSlot>> = Arc::new(DashMap::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sweeper = spawn_sweeper(slots.clone(), clock.clone(), interval);

        Self {
            slots,
            clock,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Create a store driven by an explicit clock, with no background sweep.
    ///
    /// Expired records are still replaced lazily on the next `increment`;
    /// callers that care about memory reclamation drive [`purge_expired`]
    /// themselves. Intended for tests and deterministic setups.
    ///
    /// [`purge_expired`]: InMemoryStore::purge_expired
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Remove every record whose window has already expired.
    ///
    /// Returns the number of records removed. This is the same operation the
    /// background sweep performs.
    pub fn purge_expired(&self) -> usize {
        sweep(&self.slots, self.clock.now_ms())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Cancel the background sweep task.
    ///
    /// Also happens automatically on drop; calling it twice is harmless.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            debug!("Stopped counter store sweep task");
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord> {
        let now = self.clock.now_ms();
        let window_ms = window.as_millis() as i64;

        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| WindowSlot {
                hit_count: 0,
                window_reset_at: now + window_ms,
            });

        if slot.window_reset_at <= now {
            // Window expired since the last hit; start a fresh one.
            slot.hit_count = 1;
            slot.window_reset_at = now + window_ms;
        } else {
            slot.hit_count += 1;
        }

        let record = WindowRecord {
            key: key.to_string(),
            hit_count: slot.hit_count,
            window_reset_at: slot.window_reset_at,
        };
        drop(slot);

        trace!(
            key = %record.key,
            hits = record.hit_count,
            "Counted hit"
        );

        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<Option<WindowRecord>> {
        Ok(self.slots.get(key).map(|slot| WindowRecord {
            key: key.to_string(),
            hit_count: slot.hit_count,
            window_reset_at: slot.window_reset_at,
        }))
    }
}

/// Remove expired slots, returning how many were dropped.
fn sweep(slots: &DashMap<String, WindowSlot>, now: i64) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| slot.window_reset_at > now);
    before.saturating_sub(slots.len())
}

fn spawn_sweeper(
    slots: Arc<DashMap<String, WindowSlot>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep(&slots, clock.now_ms());
            if removed > 0 {
                trace!(removed, "Swept expired rate limit records");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::evaluate;
    use crate::store::ManualClock;

    fn manual_store(start_ms: i64) -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(start_ms));
        let store = InMemoryStore::with_clock(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_first_hit_opens_window() {
        let (store, _clock) = manual_store(10_000);

        let record = store
            .increment("ip1", Duration::from_millis(1_000))
            .await
            .unwrap();

        assert_eq!(record.hit_count, 1);
        assert_eq!(record.window_reset_at, 11_000);
    }

    #[tokio::test]
    async fn test_hits_accumulate_within_window() {
        let (store, _clock) = manual_store(0);
        let window = Duration::from_secs(60);

        for expected in 1..=5u64 {
            let record = store.increment("ip1", window).await.unwrap();
            assert_eq!(record.hit_count, expected);
            assert_eq!(record.window_reset_at, 60_000);
        }
    }

    #[tokio::test]
    async fn test_expired_window_resets_count() {
        let (store, clock) = manual_store(0);
        let window = Duration::from_millis(1_000);

        for _ in 0..7 {
            store.increment("ip1", window).await.unwrap();
        }

        clock.advance(1_001);

        let record = store.increment("ip1", window).await.unwrap();
        assert_eq!(record.hit_count, 1);
        assert_eq!(record.window_reset_at, 2_001);
    }

    #[tokio::test]
    async fn test_get_is_a_snapshot() {
        let (store, _clock) = manual_store(0);
        store
            .increment("ip1", Duration::from_secs(60))
            .await
            .unwrap();

        let first = store.get("ip1").await.unwrap().unwrap();
        let second = store.get("ip1").await.unwrap().unwrap();

        assert_eq!(first.hit_count, 1);
        assert_eq!(first, second);
        assert_eq!(store.get("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_no_updates() {
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(ManualClock::starting_at(0))));
        let window = Duration::from_secs(60);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store.increment("shared", window).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get("shared").await.unwrap().unwrap();
        assert_eq!(record.hit_count, 16 * 25);
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_records() {
        let (store, clock) = manual_store(0);

        store
            .increment("old", Duration::from_millis(500))
            .await
            .unwrap();
        clock.advance(400);
        store
            .increment("fresh", Duration::from_millis(500))
            .await
            .unwrap();
        clock.advance(200);

        // "old" expired at 500, "fresh" expires at 900, now is 600.
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_record_incremented_just_before_sweep_is_retained() {
        let (store, clock) = manual_store(0);

        store
            .increment("ip1", Duration::from_millis(1_000))
            .await
            .unwrap();
        clock.advance(999);
        store
            .increment("ip1", Duration::from_millis(1_000))
            .await
            .unwrap();

        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.get("ip1").await.unwrap().unwrap().hit_count, 2);
    }

    #[tokio::test]
    async fn test_burst_then_reset_scenario() {
        let (store, clock) = manual_store(0);
        let window = Duration::from_millis(1_000);
        let max_hits = 2;

        let mut hits = Vec::new();
        let mut admitted = Vec::new();
        for _ in 0..3 {
            let record = store.increment("ip1", window).await.unwrap();
            let decision = evaluate(&record, max_hits, clock.now_ms());
            hits.push(record.hit_count);
            admitted.push(decision.admitted);
        }

        assert_eq!(hits, vec![1, 2, 3]);
        assert_eq!(admitted, vec![true, true, false]);

        clock.advance(1_100);
        let record = store.increment("ip1", window).await.unwrap();
        let decision = evaluate(&record, max_hits, clock.now_ms());
        assert_eq!(record.hit_count, 1);
        assert!(decision.admitted);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sweep_task() {
        let store = InMemoryStore::with_sweep_interval(Duration::from_millis(10));
        store.shutdown();
        // A second call must be a no-op.
        store.shutdown();
    }
}
