//! Configuration for the message cache.
//!
//! Defaults match the viewer: the newest 1000 messages on first paint,
//! 500-message pages afterwards, and a 10 second poll tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Messages fetched on session selection.
pub const FIRST_BATCH: usize = 1000;

/// Page size for prefetch, backfill, and incremental append.
pub const BATCH_SIZE: usize = 500;

/// Default interval between reconciliation polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size of the initial, newest-first window fetch.
    pub first_batch: usize,
    /// Size of every subsequent page.
    pub batch_size: usize,
    /// Poll tick used by [`SessionWatcher`](crate::SessionWatcher).
    pub poll_interval_ms: u64,
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            first_batch: FIRST_BATCH,
            batch_size: BATCH_SIZE,
            poll_interval_ms: millis(POLL_INTERVAL),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Small pages and a fast poll, for tests and simulation.
    pub fn testing() -> Self {
        Self {
            first_batch: 100,
            batch_size: 50,
            poll_interval_ms: 50,
        }
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_first_batch(mut self, n: usize) -> Self {
        self.first_batch = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject configurations the engine cannot page with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.first_batch == 0 {
            return Err(CacheError::Config("first_batch must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(CacheError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CacheError::Config("poll_interval_ms must be at least 1".into()));
        }
        Ok(())
    }
}
