//! Migration configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::ConfigError;
use crate::types::InvocationMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cluster-wide lock name
pub const DEFAULT_LOCK_RESOURCE: &str = "content-url-migration";

/// Expected worst-case cost of migrating one item
const LOCK_TTL_PER_ITEM: Duration = Duration::from_millis(100);

/// Lower bound on the lock time-to-live
const MIN_LOCK_TTL: Duration = Duration::from_secs(10);

/// Migration configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Width of each id range handed to a worker
    pub batch_size: u32,
    /// Worker pool size per phase invocation
    pub thread_count: usize,
    /// Ranges queued per worker in one batch
    pub ranges_per_thread: usize,
    /// Name of the cluster-wide lock
    pub lock_resource: String,
    /// Addresses scanned between reconciliation checkpoints
    pub reconcile_checkpoint_interval: Option<u64>,
    /// Retries for a tree entry rewrite that hits a concurrent update
    pub conflict_retries: u32,
    /// Run as a scheduled job instead of to completion
    pub run_as_scheduled_job: bool,
}

impl MigrationConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// With worker pool size
    #[inline]
    #[must_use]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// With ranges per worker
    #[inline]
    #[must_use]
    pub fn with_ranges_per_thread(mut self, ranges_per_thread: usize) -> Self {
        self.ranges_per_thread = ranges_per_thread;
        self
    }

    /// With lock resource name
    #[inline]
    #[must_use]
    pub fn with_lock_resource(mut self, resource: impl Into<String>) -> Self {
        self.lock_resource = resource.into();
        self
    }

    /// With reconciliation checkpoint interval
    #[inline]
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.reconcile_checkpoint_interval = Some(interval);
        self
    }

    /// With conflict retries
    #[inline]
    #[must_use]
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Ranges submitted per batch invocation
    #[inline]
    #[must_use]
    pub fn ranges_per_batch(&self) -> usize {
        self.thread_count.saturating_mul(self.ranges_per_thread)
    }

    /// Lock time-to-live covering the largest unit of work between heartbeats
    ///
    /// Node phases refresh once per batch, in which each worker handles
    /// `ranges_per_thread` ranges of `batch_size` items sequentially.
    /// Reconciliation refreshes once per checkpoint interval.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        let items_per_worker =
            u64::from(self.batch_size).saturating_mul(self.ranges_per_thread as u64);
        let items = items_per_worker
            .max(self.checkpoint_interval())
            .min(u64::from(u32::MAX));
        let ttl = LOCK_TTL_PER_ITEM.saturating_mul(items as u32);
        ttl.max(MIN_LOCK_TTL)
    }

    /// Addresses scanned between reconciliation checkpoints
    #[inline]
    #[must_use]
    pub fn checkpoint_interval(&self) -> u64 {
        self.reconcile_checkpoint_interval
            .unwrap_or_else(|| u64::from(self.batch_size))
    }

    /// Invocation mode implied by `run_as_scheduled_job`
    #[inline]
    #[must_use]
    pub fn default_mode(&self) -> InvocationMode {
        if self.run_as_scheduled_job {
            InvocationMode::ScheduledTick
        } else {
            InvocationMode::OneShot
        }
    }

    /// Reject values that would stall or overflow the driver
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.thread_count == 0 {
            return Err(ConfigError::Invalid("thread_count must be at least 1".into()));
        }
        if self.ranges_per_thread == 0 {
            return Err(ConfigError::Invalid(
                "ranges_per_thread must be at least 1".into(),
            ));
        }
        if self.lock_resource.trim().is_empty() {
            return Err(ConfigError::Invalid("lock_resource must not be empty".into()));
        }
        if self.reconcile_checkpoint_interval == Some(0) {
            return Err(ConfigError::Invalid(
                "reconcile_checkpoint_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            thread_count: 2,
            ranges_per_thread: 1,
            lock_resource: DEFAULT_LOCK_RESOURCE.to_string(),
            reconcile_checkpoint_interval: None,
            conflict_retries: 3,
            run_as_scheduled_job: false,
        }
    }
}
