//! Per-subject limiters.
//!
//! One window counts one subject. A [`KeyedLimiter`] keeps a limiter per
//! subject (client address, API key, ...) and creates windows on first use.
//! Shared windows derive both their store key and lock name from the subject,
//! so distinct subjects never contend on the same lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::limiter::SimpleLimiter;
use super::local::LocalWindow;
use super::shared::SharedWindow;
use super::window::{Window, WindowConfig};
use crate::error::Result;
use crate::store::{LockConfig, WindowStore};

/// Limiter over a type-erased window.
pub type DynLimiter = SimpleLimiter<Box<dyn Window>>;

/// Subject name used when the whole deployment shares one scope.
pub const GLOBAL_SUBJECT: &str = "global";

/// Builds a fresh window for a subject.
#[derive(Clone)]
pub enum WindowFactory {
    /// In-process windows, one per subject.
    Local {
        config: WindowConfig,
        clock: Arc<dyn Clock>,
    },
    /// Store-backed windows under `"{key_prefix}:{subject}"`.
    Shared {
        store: Arc<dyn WindowStore>,
        key_prefix: String,
        config: WindowConfig,
        lock: LockConfig,
        clock: Arc<dyn Clock>,
    },
}

impl WindowFactory {
    /// Local windows on the system clock.
    pub fn local(config: WindowConfig) -> Self {
        WindowFactory::Local {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Shared windows on the system clock.
    pub fn shared(
        store: Arc<dyn WindowStore>,
        key_prefix: impl Into<String>,
        config: WindowConfig,
        lock: LockConfig,
    ) -> Self {
        WindowFactory::Shared {
            store,
            key_prefix: key_prefix.into(),
            config,
            lock,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock driving created windows.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        match self {
            WindowFactory::Local { config, .. } => WindowFactory::Local { config, clock },
            WindowFactory::Shared {
                store,
                key_prefix,
                config,
                lock,
                ..
            } => WindowFactory::Shared {
                store,
                key_prefix,
                config,
                lock,
                clock,
            },
        }
    }

    /// Create the window for `subject`.
    pub fn build(&self, subject: &str) -> Result<Box<dyn Window>> {
        match self {
            WindowFactory::Local { config, clock } => {
                Ok(Box::new(LocalWindow::with_clock(*config, clock.clone())?))
            }
            WindowFactory::Shared {
                store,
                key_prefix,
                config,
                lock,
                clock,
            } => Ok(Box::new(SharedWindow::with_clock(
                store.clone(),
                window_key(key_prefix, subject),
                *config,
                *lock,
                clock.clone(),
            )?)),
        }
    }
}

/// Store key of the window counting `subject`.
pub fn window_key(prefix: &str, subject: &str) -> String {
    format!("{prefix}:{subject}")
}

/// A map of independent limiters, one per subject.
pub struct KeyedLimiter {
    factory: WindowFactory,
    capacity: u64,
    limiters: DashMap<String, Arc<DynLimiter>>,
}

impl KeyedLimiter {
    /// Create an empty keyed limiter. Fails if the factory's window settings
    /// or `capacity` are invalid.
    pub fn new(factory: WindowFactory, capacity: u64) -> Result<Self> {
        // Validate up front so bad settings fail at startup, not per request
        SimpleLimiter::new(factory.build(GLOBAL_SUBJECT)?, capacity)?;
        Ok(Self {
            factory,
            capacity,
            limiters: DashMap::new(),
        })
    }

    /// Maximum requests per subject per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The limiter for `subject`, created on first use.
    pub fn limiter_for(&self, subject: &str) -> Result<Arc<DynLimiter>> {
        if let Some(limiter) = self.limiters.get(subject) {
            return Ok(limiter.clone());
        }

        let limiter = match self.limiters.entry(subject.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!(subject = %subject, "Creating window for subject");
                let window = self.factory.build(subject)?;
                let limiter = Arc::new(SimpleLimiter::new(window, self.capacity)?);
                entry.insert(limiter.clone());
                limiter
            }
        };
        Ok(limiter)
    }

    /// Number of subjects with a live limiter.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no subject has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Evict expired slots from every window and forget subjects whose
    /// window is now empty. Returns the number of evicted slots.
    pub async fn evict_expired(&self) -> Result<usize> {
        let snapshot: Vec<(String, Arc<DynLimiter>)> = self
            .limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (subject, limiter) in snapshot {
            evicted += limiter.window().evict_expired().await?;
            let idle = limiter.window().get_current_request_count().await? == 0;
            drop(limiter);

            if idle && self.forget_if_drained(&subject) {
                debug!(subject = %subject, "Dropped idle subject");
            }
        }
        Ok(evicted)
    }

    /// Forget `subject` if no request holds its limiter and its window has
    /// nothing left to lose. Both are checked under the shard lock, so a
    /// request counted after the sweep read the window keeps the subject.
    fn forget_if_drained(&self, subject: &str) -> bool {
        self.limiters
            .remove_if(subject, |_, l| {
                Arc::strong_count(l) == 1 && l.window().is_drained()
            })
            .is_some()
    }

    /// Run [`KeyedLimiter::evict_expired`] every `interval` in the background.
    ///
    /// Reads still clean up on their own; this only bounds how much expired
    /// state builds up for subjects that stop sending requests.
    pub fn spawn_evictor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval = ?interval, "Starting background eviction");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.evict_expired().await {
                    Ok(evicted) => {
                        debug!(evicted, subjects = self.len(), "Background eviction pass")
                    }
                    Err(e) => warn!(error = %e, "Background eviction failed"),
                }
            }
        })
    }
}
