//! Capacity check on top of a sliding window.

use async_trait::async_trait;
use tracing::debug;

use super::window::Window;
use crate::error::{RateWindowError, Result};

/// Trait for rate limiter implementations.
///
/// Callers check [`Limiter::is_ratelimit_exceeded`] first and, once a request
/// is admitted, call [`Limiter::incr_request_count`] exactly once. The two
/// calls are not atomic together, so concurrent callers may both be admitted
/// near the limit.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Whether the subject has used up its capacity for the current window.
    async fn is_ratelimit_exceeded(&self) -> Result<bool>;

    /// Record one admitted request.
    async fn incr_request_count(&self) -> Result<()>;
}

/// A limiter that compares a window's count against a fixed capacity.
pub struct SimpleLimiter<W: Window> {
    window: W,
    capacity: u64,
}

impl<W: Window> SimpleLimiter<W> {
    /// Create a limiter allowing `capacity` requests per window.
    pub fn new(window: W, capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self { window, capacity })
    }

    /// Maximum requests admitted per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The underlying window.
    pub fn window(&self) -> &W {
        &self.window
    }
}

#[async_trait]
impl<W: Window> Limiter for SimpleLimiter<W> {
    async fn is_ratelimit_exceeded(&self) -> Result<bool> {
        let count = self.window.get_current_request_count().await?;
        let exceeded = count >= self.capacity;
        if exceeded {
            debug!(count, capacity = self.capacity, "Rate limit exceeded");
        }
        Ok(exceeded)
    }

    async fn incr_request_count(&self) -> Result<()> {
        self.window.incr_request_count().await
    }
}
