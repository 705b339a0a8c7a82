//! Error types for ratewindow.

use std::time::Duration;

use thiserror::Error;

/// Main error type for ratewindow operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// The shared window lock could not be acquired in time
    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    /// The shared store is unreachable or returned an error
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Window, limiter or service configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for RateWindowError {
    fn from(err: redis::RedisError) -> Self {
        RateWindowError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for ratewindow operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;
