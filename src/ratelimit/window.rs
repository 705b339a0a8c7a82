//! The sliding window abstraction and its bucketing arithmetic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RateWindowError, Result};

/// A trailing time window that counts requests in fixed-size buckets.
///
/// Implementations keep a `slot -> count` mapping where
/// `slot = floor(now / precision)`. Reads drop every slot older than
/// the window before summing, so expired buckets never contribute.
#[async_trait]
pub trait Window: Send + Sync {
    /// Record one request in the current slot.
    async fn incr_request_count(&self) -> Result<()>;

    /// Total requests across the slots still inside the window.
    async fn get_current_request_count(&self) -> Result<u64>;

    /// Evict expired slots without summing. Returns how many were removed.
    async fn evict_expired(&self) -> Result<usize>;

    /// Whether dropping this handle would lose no counted requests.
    ///
    /// Must not block: it is called while a map shard is locked.
    fn is_drained(&self) -> bool;
}

#[async_trait]
impl<W: Window + ?Sized> Window for Box<W> {
    async fn incr_request_count(&self) -> Result<()> {
        (**self).incr_request_count().await
    }

    async fn get_current_request_count(&self) -> Result<u64> {
        (**self).get_current_request_count().await
    }

    async fn evict_expired(&self) -> Result<usize> {
        (**self).evict_expired().await
    }

    fn is_drained(&self) -> bool {
        (**self).is_drained()
    }
}

#[async_trait]
impl<W: Window + ?Sized> Window for std::sync::Arc<W> {
    async fn incr_request_count(&self) -> Result<()> {
        (**self).incr_request_count().await
    }

    async fn get_current_request_count(&self) -> Result<u64> {
        (**self).get_current_request_count().await
    }

    async fn evict_expired(&self) -> Result<usize> {
        (**self).evict_expired().await
    }

    fn is_drained(&self) -> bool {
        (**self).is_drained()
    }
}

/// Bucketing parameters for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Seconds per bucket
    #[serde(default = "default_precision")]
    pub precision: u64,
    /// Seconds covered by the window
    #[serde(default = "default_window_size")]
    pub window_size: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            window_size: default_window_size(),
        }
    }
}

fn default_precision() -> u64 {
    1
}

fn default_window_size() -> u64 {
    60
}

impl WindowConfig {
    /// Create a validated window configuration.
    pub fn new(precision: u64, window_size: u64) -> Result<Self> {
        let config = Self {
            precision,
            window_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check `precision >= 1`, `window_size >= precision` and that both fit
    /// the signed seconds the clock works in.
    pub fn validate(&self) -> Result<()> {
        if self.precision == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "precision must be at least 1 second".to_string(),
            ));
        }
        if self.window_size < self.precision {
            return Err(RateWindowError::InvalidConfiguration(format!(
                "window_size ({}) must not be smaller than precision ({})",
                self.window_size, self.precision
            )));
        }
        if self.window_size > i64::MAX as u64 {
            return Err(RateWindowError::InvalidConfiguration(format!(
                "window_size ({}) must not exceed {} seconds",
                self.window_size,
                i64::MAX
            )));
        }
        Ok(())
    }

    /// The slot a request made at `now` falls into.
    pub fn slot(&self, now: i64) -> i64 {
        now.div_euclid(self.precision as i64)
    }

    /// The oldest slot still inside the window at `now`.
    ///
    /// Floor division keeps this well defined when `now < window_size`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(self.window_size as i64)
            .div_euclid(self.precision as i64)
    }

    /// Upper bound on the number of live slots.
    pub fn max_slots(&self) -> u64 {
        self.window_size / self.precision + 1
    }
}
