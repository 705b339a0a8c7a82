//! In-process sliding window.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::window::{Window, WindowConfig};
use crate::error::Result;

/// A sliding window whose buckets live in process memory.
///
/// Slots are kept ordered so eviction is a single split at the window start.
pub struct LocalWindow {
    config: WindowConfig,
    clock: Arc<dyn Clock>,
    /// slot -> request count
    slots: Mutex<BTreeMap<i64, u64>>,
}

impl LocalWindow {
    /// Create a window driven by the system clock.
    pub fn new(config: WindowConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a window driven by the given clock.
    pub fn with_clock(config: WindowConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// Window configuration.
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Number of slots currently retained, expired or not.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn cleanup(slots: &mut BTreeMap<i64, u64>, window_start: i64) -> usize {
        let live = slots.split_off(&window_start);
        let evicted = slots.len();
        *slots = live;
        evicted
    }
}

#[async_trait]
impl Window for LocalWindow {
    async fn incr_request_count(&self) -> Result<()> {
        let slot = self.config.slot(self.clock.now_secs());
        let mut slots = self.slots.lock();
        *slots.entry(slot).or_insert(0) += 1;
        Ok(())
    }

    async fn get_current_request_count(&self) -> Result<u64> {
        let window_start = self.config.window_start(self.clock.now_secs());
        let mut slots = self.slots.lock();

        let evicted = Self::cleanup(&mut slots, window_start);
        if evicted > 0 {
            debug!(evicted, window_start, "Evicted expired local slots");
        }

        let count = slots.values().sum();
        trace!(count, window_start, "Local window count");
        Ok(count)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let window_start = self.config.window_start(self.clock.now_secs());
        let mut slots = self.slots.lock();
        Ok(Self::cleanup(&mut slots, window_start))
    }

    fn is_drained(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
