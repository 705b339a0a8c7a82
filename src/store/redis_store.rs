//! Redis-backed store.
//!
//! Slot counts live in a Redis hash (`HINCRBY` / `HGETALL` / `HDEL`). The lock
//! is a plain key set with `SET NX PX` and released by a compare-and-delete
//! script, so an expired holder never frees a lock someone else now owns.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::WindowStore;
use crate::error::Result;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A [`WindowStore`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    release: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    ///
    /// Connecting and every command are bounded by `response_timeout`; a
    /// server that stops answering surfaces as `StoreUnavailable`.
    pub async fn connect(url: &str, response_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(response_timeout)
            .set_response_timeout(response_timeout);
        let conn = ConnectionManager::new_with_config(client, manager_config).await?;
        info!(url = %url, response_timeout = ?response_timeout, "Connected to Redis");
        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn incr_field(&self, key: &str, slot: i64, by: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.hincr(key, slot, by).await?;
        Ok(count)
    }

    async fn fetch_all(&self, key: &str) -> Result<Vec<(String, u64)>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, u64> = conn.hgetall(key).await?;
        Ok(fields.into_iter().collect())
    }

    async fn delete_fields(&self, key: &str, slots: &[i64]) -> Result<()> {
        if slots.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.hdel(key, slots).await?;
        debug!(key = %key, removed, "Deleted expired slot fields");
        Ok(())
    }

    async fn try_acquire_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
