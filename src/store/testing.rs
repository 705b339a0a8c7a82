//! Failing stores for tests.

use std::time::Duration;

use async_trait::async_trait;

use super::WindowStore;
use crate::error::{RateWindowError, Result};

fn refused() -> RateWindowError {
    RateWindowError::StoreUnavailable("connection refused".to_string())
}

/// A store whose every call fails, as if the server were unreachable.
pub(crate) struct DownStore;

#[async_trait]
impl WindowStore for DownStore {
    async fn incr_field(&self, _: &str, _: i64, _: u64) -> Result<u64> {
        Err(refused())
    }
    async fn fetch_all(&self, _: &str) -> Result<Vec<(String, u64)>> {
        Err(refused())
    }
    async fn delete_fields(&self, _: &str, _: &[i64]) -> Result<()> {
        Err(refused())
    }
    async fn try_acquire_lock(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
        Err(refused())
    }
    async fn release_lock(&self, _: &str, _: &str) -> Result<bool> {
        Err(refused())
    }
}

/// A store whose calls never complete, as if the server stopped answering.
pub(crate) struct StalledStore;

#[async_trait]
impl WindowStore for StalledStore {
    async fn incr_field(&self, _: &str, _: i64, _: u64) -> Result<u64> {
        std::future::pending().await
    }
    async fn fetch_all(&self, _: &str) -> Result<Vec<(String, u64)>> {
        std::future::pending().await
    }
    async fn delete_fields(&self, _: &str, _: &[i64]) -> Result<()> {
        std::future::pending().await
    }
    async fn try_acquire_lock(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
        std::future::pending().await
    }
    async fn release_lock(&self, _: &str, _: &str) -> Result<bool> {
        std::future::pending().await
    }
}
