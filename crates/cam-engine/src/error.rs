//! Error types for the migration engine
//!
//! Provides error handling for:
//! - Node, blob and address-table store failures
//! - Aggregated range worker failures
//! - Lock loss and registry failures surfaced to the sequencer

use cam_core::{ConfigError, ContentAddress, IdRange, LockError, MigrationPhase, RegistryError};
use std::fmt;

/// Failure reported by an external store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Entry changed between read and write
    #[error("concurrent update of entry {id}")]
    Conflict { id: i64 },

    /// Address table already holds this address
    #[error("address `{0}` is already registered")]
    UniqueViolation(ContentAddress),

    /// Store not reachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if retrying the same operation may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// One failed range within a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFailure {
    /// Range whose unit of work failed
    pub range: IdRange,
    /// Worker error text
    pub error: String,
}

impl fmt::Display for RangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.range, self.error)
    }
}

/// Main migration error type
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Another node holds the migration lock
    #[error("migration lock `{resource}` is held by another node")]
    LockUnavailable { resource: String },

    /// Lock heartbeat or lock service failure
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Progress could not be read or persisted
    #[error("progress registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Store failure outside range workers
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// One or more ranges in a batch failed
    #[error(
        "{phase}: {failed} of {submitted} ranges failed ({})",
        join_failures(.failures)
    )]
    RangeWorkers {
        phase: MigrationPhase,
        submitted: usize,
        failed: usize,
        failures: Vec<RangeFailure>,
    },

    /// Phase ordering violated
    #[error("{phase} cannot run before {waiting_on} is done")]
    NotReady {
        phase: MigrationPhase,
        waiting_on: MigrationPhase,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MigrationError {
    /// Check if the lock was lost mid-invocation
    #[inline]
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::Lock(e) if e.is_lost())
    }

    /// Check if the next invocation may succeed without operator action
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockUnavailable { .. } | Self::Lock(_) | Self::RangeWorkers { .. } => true,
            Self::Store(e) => e.is_retryable(),
            Self::Registry(_) | Self::NotReady { .. } | Self::Config(_) => false,
        }
    }
}

fn join_failures(failures: &[RangeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
