//! Configuration management for ratewindow.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateWindowError, Result};
use crate::ratelimit::WindowConfig;
use crate::store::LockConfig;

/// Main configuration for the ratewindow service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindowConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window and capacity settings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission policy at the service boundary
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Window and capacity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Bucketing of the sliding window
    #[serde(flatten)]
    pub window: WindowConfig,

    /// Maximum requests per subject per window
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> u64 {
    100
}

/// Where window buckets are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Per-process map, not shared between instances
    Local,
    /// In-process store going through the shared window code path
    Memory,
    /// Redis hash plus Redis lock, shared between instances
    Redis,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of window keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on connecting to and each command against Redis
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Lease lock timing
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            response_timeout_ms: default_response_timeout_ms(),
            lock: LockConfig::default(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Local
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    "ratewindow".to_string()
}

fn default_response_timeout_ms() -> u64 {
    500
}

impl StoreConfig {
    /// Redis connect and command timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// What the service boundary does when the limiter itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request without counting it
    FailOpen,
    /// Reject the request as unavailable
    FailClosed,
}

/// How requests are grouped into rate-limited subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectSource {
    /// A single window for every caller
    Global,
    /// One window per client IP address
    ClientIp,
}

/// Admission policy at the service boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Policy on limiter errors
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,

    /// Subject grouping
    #[serde(default = "default_subject")]
    pub subject: SubjectSource,

    /// Background eviction interval in seconds. When unset, per-client
    /// subjects still get a default sweep; a global subject relies on
    /// read-time cleanup alone.
    #[serde(default)]
    pub eviction_interval_secs: Option<u64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            failure_policy: default_failure_policy(),
            subject: default_subject(),
            eviction_interval_secs: None,
        }
    }
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::FailOpen
}

fn default_subject() -> SubjectSource {
    SubjectSource::Global
}

/// Cap on the sweep interval derived from the window size.
const MAX_DEFAULT_EVICTION_SECS: u64 = 300;

impl AdmissionConfig {
    /// How often to sweep idle subjects, if at all.
    ///
    /// Per-client subjects accumulate one limiter per address seen, so they
    /// are always swept: by default once per window, at most every five
    /// minutes.
    pub fn eviction_interval(&self, window: &WindowConfig) -> Option<Duration> {
        match (self.eviction_interval_secs, self.subject) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, SubjectSource::ClientIp) => Some(Duration::from_secs(
                window.window_size.min(MAX_DEFAULT_EVICTION_SECS),
            )),
            (None, SubjectSource::Global) => None,
        }
    }
}

impl RateWindowConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateWindowConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RateWindowError::InvalidConfiguration(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check window, capacity, lock and eviction settings.
    pub fn validate(&self) -> Result<()> {
        self.limits.window.validate()?;
        if self.limits.capacity == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "capacity must be at least 1".to_string(),
            ));
        }
        self.store.lock.validate()?;
        if self.store.response_timeout_ms == 0 {
            return Err(RateWindowError::InvalidConfiguration(
                "response_timeout_ms must be positive".to_string(),
            ));
        }
        if self.admission.eviction_interval_secs == Some(0) {
            return Err(RateWindowError::InvalidConfiguration(
                "eviction_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
