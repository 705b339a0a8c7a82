//! Sliding window stored in a shared external store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::window::{Window, WindowConfig};
use crate::error::Result;
use crate::store::{LockConfig, SharedLock, WindowStore};

/// Store key used when a single window covers the whole deployment.
pub const DEFAULT_WINDOW_KEY: &str = "ratewindow:global";

/// A sliding window whose buckets live in a [`WindowStore`] hash.
///
/// Several limiter instances may point at the same key. Every operation runs
/// under the store-hosted lock named `"{key}:lock"`, so the read, cleanup and
/// sum sequence never interleaves with another instance's writes.
pub struct SharedWindow<S: WindowStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    lock: SharedLock<S>,
    config: WindowConfig,
    clock: Arc<dyn Clock>,
}

impl<S: WindowStore + ?Sized + 'static> SharedWindow<S> {
    /// Create a window under `key`, driven by the system clock.
    pub fn new(
        store: Arc<S>,
        key: impl Into<String>,
        config: WindowConfig,
        lock_config: LockConfig,
    ) -> Result<Self> {
        Self::with_clock(store, key, config, lock_config, Arc::new(SystemClock))
    }

    /// Create a window under `key`, driven by the given clock.
    pub fn with_clock(
        store: Arc<S>,
        key: impl Into<String>,
        config: WindowConfig,
        lock_config: LockConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        lock_config.validate()?;

        let key = key.into();
        let lock = SharedLock::new(store.clone(), lock_name(&key), lock_config);
        Ok(Self {
            store,
            key,
            lock,
            config,
            clock,
        })
    }

    /// The store key holding this window's slots.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lock serializing access to this window.
    pub fn lock(&self) -> &SharedLock<S> {
        &self.lock
    }

    /// Delete expired slots, returning the live ones and how many were
    /// evicted. Caller holds the lock.
    async fn cleanup(&self, window_start: i64) -> Result<(Vec<(i64, u64)>, usize)> {
        let fields = self.store.fetch_all(&self.key).await?;

        let mut live = Vec::with_capacity(fields.len());
        let mut expired = Vec::new();
        for (field, count) in fields {
            match field.parse::<i64>() {
                Ok(slot) if slot < window_start => expired.push(slot),
                Ok(slot) => live.push((slot, count)),
                Err(_) => warn!(key = %self.key, field = %field, "Ignoring non-slot field"),
            }
        }

        if !expired.is_empty() {
            debug!(key = %self.key, evicted = expired.len(), window_start, "Evicting expired slots");
            self.store.delete_fields(&self.key, &expired).await?;
        }
        Ok((live, expired.len()))
    }
}

/// Lock name guarding the window stored under `key`.
pub fn lock_name(key: &str) -> String {
    format!("{key}:lock")
}

#[async_trait]
impl<S: WindowStore + ?Sized + 'static> Window for SharedWindow<S> {
    async fn incr_request_count(&self) -> Result<()> {
        self.lock
            .run(|| async move {
                let slot = self.config.slot(self.clock.now_secs());
                let count = self.store.incr_field(&self.key, slot, 1).await?;
                trace!(key = %self.key, slot, count, "Incremented shared slot");
                Ok(())
            })
            .await
    }

    async fn get_current_request_count(&self) -> Result<u64> {
        self.lock
            .run(|| async move {
                let window_start = self.config.window_start(self.clock.now_secs());
                let (live, _) = self.cleanup(window_start).await?;
                let count: u64 = live.iter().map(|(_, c)| c).sum();
                trace!(key = %self.key, count, window_start, "Shared window count");
                Ok(count)
            })
            .await
    }

    async fn evict_expired(&self) -> Result<usize> {
        self.lock
            .run(|| async move {
                let window_start = self.config.window_start(self.clock.now_secs());
                let (_, evicted) = self.cleanup(window_start).await?;
                Ok(evicted)
            })
            .await
    }

    // Counts live in the store and outlive this handle
    fn is_drained(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateWindowError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::local::LocalWindow;
    use crate::store::testing::{DownStore, StalledStore};
    use crate::store::MemoryStore;

    fn shared_at(
        store: Arc<MemoryStore>,
        precision: u64,
        window_size: u64,
        clock: Arc<ManualClock>,
    ) -> SharedWindow<MemoryStore> {
        let config = WindowConfig::new(precision, window_size).unwrap();
        SharedWindow::with_clock(store, DEFAULT_WINDOW_KEY, config, LockConfig::default(), clock)
            .unwrap()
    }

    #[tokio::test]
    async fn test_counts_increments_in_one_slot() {
        let store = Arc::new(MemoryStore::new());
        let window = shared_at(store, 60, 60, Arc::new(ManualClock::new(1_700_000_000)));

        for _ in 0..3 {
            window.incr_request_count().await.unwrap();
        }

        assert_eq!(window.get_current_request_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_expired_slots_are_deleted_from_store() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let window = shared_at(store.clone(), 1, 5, clock.clone());

        for _ in 0..3 {
            window.incr_request_count().await.unwrap();
        }
        clock.advance(6);
        window.incr_request_count().await.unwrap();
        window.incr_request_count().await.unwrap();

        assert_eq!(store.field_count(DEFAULT_WINDOW_KEY), 2);
        assert_eq!(window.get_current_request_count().await.unwrap(), 2);
        assert_eq!(store.field_count(DEFAULT_WINDOW_KEY), 1);
    }

    #[tokio::test]
    async fn test_reads_are_idempotent_and_release_lock() {
        let store = Arc::new(MemoryStore::new());
        let window = shared_at(store.clone(), 1, 5, Arc::new(ManualClock::new(10)));

        window.incr_request_count().await.unwrap();
        let first = window.get_current_request_count().await.unwrap();
        let second = window.get_current_request_count().await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(first, second);
        assert!(!store.is_locked(&lock_name(DEFAULT_WINDOW_KEY)));
    }

    #[tokio::test]
    async fn test_non_slot_fields_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let window = shared_at(store.clone(), 1, 5, Arc::new(ManualClock::new(10)));

        store.insert_raw(DEFAULT_WINDOW_KEY, "not-a-slot", 99);
        window.incr_request_count().await.unwrap();

        assert_eq!(window.get_current_request_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_instances_on_same_key_share_counts() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(500));
        let a = shared_at(store.clone(), 1, 5, clock.clone());
        let b = shared_at(store.clone(), 1, 5, clock);

        a.incr_request_count().await.unwrap();
        b.incr_request_count().await.unwrap();

        assert_eq!(a.get_current_request_count().await.unwrap(), 2);
        assert_eq!(b.get_current_request_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let config = WindowConfig::new(60, 60).unwrap();
        let lock_config = LockConfig {
            timeout_ms: 5_000,
            retry_ms: 1,
            ..LockConfig::default()
        };

        let windows: Vec<_> = (0..50)
            .map(|_| {
                Arc::new(
                    SharedWindow::with_clock(
                        store.clone(),
                        DEFAULT_WINDOW_KEY,
                        config,
                        lock_config,
                        clock.clone(),
                    )
                    .unwrap(),
                )
            })
            .collect();

        let tasks = windows.iter().cloned().map(|w| {
            tokio::spawn(async move { w.incr_request_count().await })
        });
        for joined in futures::future::join_all(tasks).await {
            joined.unwrap().unwrap();
        }

        assert_eq!(windows[0].get_current_request_count().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_matches_local_window_for_same_sequence() {
        let clock = Arc::new(ManualClock::new(2_000));
        let config = WindowConfig::new(2, 10).unwrap();
        let local = LocalWindow::with_clock(config, clock.clone()).unwrap();
        let shared = shared_at(Arc::new(MemoryStore::new()), 2, 10, clock.clone());

        for step in [0, 1, 3, 0, 4, 7, 2, 11, 1] {
            clock.advance(step);
            local.incr_request_count().await.unwrap();
            shared.incr_request_count().await.unwrap();

            assert_eq!(
                local.get_current_request_count().await.unwrap(),
                shared.get_current_request_count().await.unwrap(),
                "diverged at t={}",
                clock.now_secs()
            );
        }
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_error() {
        let config = WindowConfig::new(1, 5).unwrap();
        let window = SharedWindow::new(Arc::new(DownStore), "down", config, LockConfig::default())
            .unwrap();

        assert!(matches!(
            window.incr_request_count().await,
            Err(RateWindowError::StoreUnavailable(_))
        ));
        assert!(matches!(
            window.get_current_request_count().await,
            Err(RateWindowError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let lock_config = LockConfig {
            timeout_ms: 30,
            retry_ms: 5,
            ..LockConfig::default()
        };
        let window = SharedWindow::new(
            Arc::new(StalledStore),
            "stalled",
            WindowConfig::new(1, 5).unwrap(),
            lock_config,
        )
        .unwrap();

        assert!(matches!(
            window.incr_request_count().await,
            Err(RateWindowError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let store = Arc::new(MemoryStore::new());
        let config = WindowConfig::new(1, 5).unwrap();
        let lock_config = LockConfig {
            timeout_ms: 30,
            retry_ms: 5,
            ..LockConfig::default()
        };
        let window = SharedWindow::new(store.clone(), "busy", config, lock_config).unwrap();

        let _held = window.lock().acquire().await.unwrap();

        assert!(matches!(
            window.get_current_request_count().await,
            Err(RateWindowError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_evict_expired_counts_removed_fields() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let window = shared_at(store.clone(), 1, 5, clock.clone());

        window.incr_request_count().await.unwrap();
        clock.advance(1);
        window.incr_request_count().await.unwrap();
        clock.advance(20);

        assert_eq!(window.evict_expired().await.unwrap(), 2);
        assert_eq!(store.field_count(DEFAULT_WINDOW_KEY), 0);
    }
}
