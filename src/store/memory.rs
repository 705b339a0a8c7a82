//! In-process store implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::WindowStore;
use crate::error::Result;

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// A [`WindowStore`] kept in process memory.
///
/// Behaves like the Redis store, lease expiry included, so shared windows can
/// run without a server. Cloning is not supported; share it through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, u64>>,
    locks: DashMap<String, Lease>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields stored under `key`.
    pub fn field_count(&self, key: &str) -> usize {
        self.hashes.get(key).map(|h| h.len()).unwrap_or(0)
    }

    /// Store a raw field, bypassing slot encoding.
    pub fn insert_raw(&self, key: &str, field: &str, value: u64) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Whether lock `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn incr_field(&self, key: &str, slot: i64, by: u64) -> Result<u64> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let count = hash.entry(slot.to_string()).or_insert(0);
        *count += by;
        Ok(*count)
    }

    async fn fetch_all(&self, key: &str) -> Result<Vec<(String, u64)>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, c)| (f.clone(), *c)).collect())
            .unwrap_or_default())
    }

    async fn delete_fields(&self, key: &str, slots: &[i64]) -> Result<()> {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            for slot in slots {
                hash.remove(&slot.to_string());
            }
        }
        // Redis drops a hash once its last field is gone
        self.hashes.remove_if(key, |_, hash| hash.is_empty());
        Ok(())
    }

    async fn try_acquire_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self.locks.entry(name.to_string()).or_insert_with(|| Lease {
            token: String::new(),
            expires_at: now,
        });

        if entry.expires_at > now {
            return Ok(false);
        }

        trace!(lock = %name, "Memory lock acquired");
        entry.token = token.to_string();
        entry.expires_at = now + lease;
        Ok(true)
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool> {
        let released = self
            .locks
            .remove_if(name, |_, lease| lease.token == token)
            .is_some();
        Ok(released)
    }
}
