//! Store-hosted lease lock with scoped acquisition.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::WindowStore;
use crate::error::{RateWindowError, Result};

/// Timing parameters for a [`SharedLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long the store keeps the lock if the holder never releases it
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// How long to wait for the lock before giving up
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pause between acquisition attempts (jitter is added on top)
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            timeout_ms: default_timeout_ms(),
            retry_ms: default_retry_ms(),
        }
    }
}

fn default_lease_ms() -> u64 {
    2000
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retry_ms() -> u64 {
    10
}

impl LockConfig {
    /// Lease duration.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Acquisition timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check that the lease and retry interval are non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ms == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "lock lease_ms must be positive".to_string(),
            ));
        }
        if self.retry_ms == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "lock retry_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named mutual-exclusion lock held in a [`WindowStore`].
///
/// Every acquisition uses a fresh token, and release only succeeds while the
/// store still holds that token.
pub struct SharedLock<S: WindowStore + ?Sized + 'static> {
    store: Arc<S>,
    name: String,
    config: LockConfig,
}

impl<S: WindowStore + ?Sized + 'static> SharedLock<S> {
    /// Create a lock handle. Nothing is acquired yet.
    pub fn new(store: Arc<S>, name: impl Into<String>, config: LockConfig) -> Self {
        Self {
            store,
            name: name.into(),
            config,
        }
    }

    /// The lock key in the store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the lock, retrying until the configured timeout elapses.
    ///
    /// The timeout also bounds each store round-trip, so a store that stops
    /// answering yields [`RateWindowError::LockTimeout`] instead of a hang.
    pub async fn acquire(&self) -> Result<LockGuard<S>> {
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.config.timeout();

        loop {
            let attempt = self
                .store
                .try_acquire_lock(&self.name, &token, self.config.lease());
            let remaining = deadline.saturating_duration_since(Instant::now());

            // An abandoned attempt may still land; the lease frees it
            let Ok(acquired) = tokio::time::timeout(remaining, attempt).await else {
                warn!(lock = %self.name, "Store did not answer lock attempt in time");
                return Err(self.timed_out(started));
            };

            if acquired? {
                trace!(lock = %self.name, waited = ?started.elapsed(), "Lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    name: self.name.clone(),
                    token,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %self.name, "Lock acquisition timed out");
                return Err(self.timed_out(started));
            }

            let jitter = rand::thread_rng().gen_range(0..=self.config.retry_ms / 2);
            let pause = Duration::from_millis(self.config.retry_ms + jitter);
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    fn timed_out(&self, started: Instant) -> RateWindowError {
        RateWindowError::LockTimeout {
            name: self.name.clone(),
            waited: started.elapsed(),
        }
    }

    /// Run `op` while holding the lock.
    ///
    /// `op` and the release each get at most one lease: past that the lock
    /// may already belong to someone else. An overrunning `op` fails with
    /// [`RateWindowError::StoreUnavailable`]. A failed release is logged and
    /// left to lease expiry; the result of `op` is returned.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.config.lease();
        let guard = self.acquire().await?;

        let result = match tokio::time::timeout(lease, op()).await {
            Ok(result) => result,
            Err(_) => Err(RateWindowError::StoreUnavailable(format!(
                "operation under lock '{}' outlived its {:?} lease",
                self.name, lease
            ))),
        };

        match tokio::time::timeout(lease, guard.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(lock = %self.name, error = %e, "Failed to release lock, waiting for lease expiry")
            }
            Err(_) => warn!(lock = %self.name, "Lock release stalled, waiting for lease expiry"),
        }
        result
    }
}

/// Proof of holding a [`SharedLock`].
///
/// Prefer [`LockGuard::release`]. A guard dropped without release (a panic or
/// a cancelled future) schedules the release on the current runtime.
pub struct LockGuard<S: WindowStore + ?Sized + 'static> {
    store: Arc<S>,
    name: String,
    token: String,
    released: bool,
}

impl<S: WindowStore + ?Sized + 'static> LockGuard<S> {
    /// The lock key in the store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock.
    ///
    /// If this future is dropped before the store answers, the guard's drop
    /// still schedules a release.
    pub async fn release(mut self) -> Result<()> {
        let held = self.store.release_lock(&self.name, &self.token).await?;
        self.released = true;
        if !held {
            warn!(lock = %self.name, "Lock lease expired before release");
        }
        Ok(())
    }
}

impl<S: WindowStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "No runtime to release dropped lock, waiting for lease expiry");
            return;
        };

        let store = self.store.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.release_lock(&name, &token).await {
                warn!(lock = %name, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::StalledStore;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_config() -> LockConfig {
        LockConfig {
            lease_ms: 5000,
            timeout_ms: 50,
            retry_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_run_releases_after_success() {
        let store = Arc::new(MemoryStore::new());
        let lock = SharedLock::new(store.clone(), "l", fast_config());

        let value = lock.run(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!store.is_locked("l"));
    }

    #[tokio::test]
    async fn test_run_releases_after_error() {
        let store = Arc::new(MemoryStore::new());
        let lock = SharedLock::new(store.clone(), "l", fast_config());

        let result: Result<()> = lock
            .run(|| async { Err(RateWindowError::StoreUnavailable("boom".to_string())) })
            .await;

        assert!(matches!(result, Err(RateWindowError::StoreUnavailable(_))));
        assert!(!store.is_locked("l"));
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let store = Arc::new(MemoryStore::new());
        let holder = SharedLock::new(store.clone(), "l", fast_config());
        let waiter = SharedLock::new(store.clone(), "l", fast_config());

        let guard = holder.acquire().await.unwrap();
        let err = waiter.acquire().await.err().unwrap();

        match err {
            RateWindowError::LockTimeout { name, waited } => {
                assert_eq!(name, "l");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }

        guard.release().await.unwrap();
        assert!(waiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_once_released() {
        let store = Arc::new(MemoryStore::new());
        let config = LockConfig {
            timeout_ms: 1000,
            ..fast_config()
        };
        let holder = SharedLock::new(store.clone(), "l", config);
        let waiter = SharedLock::new(store.clone(), "l", config);

        let guard = holder.acquire().await.unwrap();
        let pending = tokio::spawn(async move { waiter.acquire().await.map(|g| g.name().to_string()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), "l");
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = Arc::new(MemoryStore::new());
        let lock = SharedLock::new(store.clone(), "l", fast_config());

        drop(lock.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!store.is_locked("l"));
    }

    #[tokio::test]
    async fn test_acquire_is_bounded_when_store_stalls() {
        let lock = SharedLock::new(Arc::new(StalledStore), "l", fast_config());

        let outcome = tokio::time::timeout(Duration::from_secs(2), lock.acquire())
            .await
            .expect("acquire must give up on its own");

        match outcome.err().unwrap() {
            RateWindowError::LockTimeout { name, waited } => {
                assert_eq!(name, "l");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_bounds_operation_by_lease() {
        let store = Arc::new(MemoryStore::new());
        let config = LockConfig {
            lease_ms: 50,
            ..fast_config()
        };
        let lock = SharedLock::new(store.clone(), "l", config);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            lock.run(|| std::future::pending::<Result<()>>()),
        )
        .await
        .expect("run must give up once the lease is spent");

        assert!(matches!(result, Err(RateWindowError::StoreUnavailable(_))));
        assert!(!store.is_locked("l"));
    }

    /// Delegates to a [`MemoryStore`], except that the first release never
    /// gets an answer.
    struct SlowFirstRelease {
        inner: MemoryStore,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl WindowStore for SlowFirstRelease {
        async fn incr_field(&self, key: &str, slot: i64, by: u64) -> Result<u64> {
            self.inner.incr_field(key, slot, by).await
        }
        async fn fetch_all(&self, key: &str) -> Result<Vec<(String, u64)>> {
            self.inner.fetch_all(key).await
        }
        async fn delete_fields(&self, key: &str, slots: &[i64]) -> Result<()> {
            self.inner.delete_fields(key, slots).await
        }
        async fn try_acquire_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
            self.inner.try_acquire_lock(name, token, lease).await
        }
        async fn release_lock(&self, name: &str, token: &str) -> Result<bool> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.release_lock(name, token).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_release_falls_back_to_drop() {
        let store = Arc::new(SlowFirstRelease {
            inner: MemoryStore::new(),
            stalled: AtomicBool::new(false),
        });
        let lock = SharedLock::new(store.clone(), "l", fast_config());

        let guard = lock.acquire().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), guard.release())
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.inner.is_locked("l"));
    }

    #[test]
    fn test_lock_config_validation() {
        assert!(LockConfig::default().validate().is_ok());

        let zero_lease = LockConfig {
            lease_ms: 0,
            ..LockConfig::default()
        };
        assert!(zero_lease.validate().is_err());
    }
}
