//! Shared storage backends for sliding windows.
//!
//! A store hosts two things for each shared window: a hash of
//! `slot -> count` fields under the window key, and a lease lock that
//! serializes access to that hash across limiter instances.

mod lock;
mod memory;
mod redis_store;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::lock::{LockConfig, LockGuard, SharedLock};
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Hash and lease-lock primitives a shared window needs from its store.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically add `by` to field `slot` of hash `key`, returning the new value.
    async fn incr_field(&self, key: &str, slot: i64, by: u64) -> Result<u64>;

    /// Read every field of hash `key`. Field names are returned as stored.
    async fn fetch_all(&self, key: &str) -> Result<Vec<(String, u64)>>;

    /// Remove the given slot fields from hash `key`.
    async fn delete_fields(&self, key: &str, slots: &[i64]) -> Result<()>;

    /// Take lock `name` for `lease` if nobody holds it. Returns whether it was taken.
    async fn try_acquire_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release lock `name` if it is still held under `token`.
    async fn release_lock(&self, name: &str, token: &str) -> Result<bool>;
}
