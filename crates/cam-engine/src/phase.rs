//! Phase drivers
//!
//! Every phase, whatever store it walks, is driven through [`PhaseDriver`] so
//! the sequencer can iterate an ordered list of phases uniformly.

use crate::driver::{RangeBatchDriver, RangeWork};
use crate::error::{MigrationError, StoreError};
use crate::store::{RelationalStore, TreeStore};
use async_trait::async_trait;
use cam_core::{IdRange, LockSession, MigrationPhase, ProgressRecord, ShutdownSignal};
use std::fmt;
use std::sync::Arc;

/// Position reached by a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Phase has not started
    NotStarted,
    /// Id-space phase position
    Cursor {
        /// Next id to process
        cursor: i64,
        /// Exclusive upper bound
        high_water_mark: i64,
    },
    /// Reconciliation position
    Scanned {
        /// Addresses scanned in this invocation
        addresses: u64,
        /// Percent of stored bytes scanned, when the store size is known
        percent: Option<u8>,
    },
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::NotStarted => write!(f, "not started"),
            Progress::Cursor {
                cursor,
                high_water_mark,
            } => write!(f, "at id {cursor} of {high_water_mark}"),
            Progress::Scanned {
                addresses,
                percent: Some(percent),
            } => write!(f, "scanned {addresses} addresses ({percent}% of stored bytes)"),
            Progress::Scanned {
                addresses,
                percent: None,
            } => write!(f, "scanned {addresses} addresses"),
        }
    }
}

/// Result of one phase invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Work was done and more remains
    InProgress(Progress),
    /// Phase finished, now or earlier
    Done,
    /// An earlier phase has to finish first
    NotReady {
        /// Phase still pending
        waiting_on: MigrationPhase,
    },
    /// Stopped early because shutdown was requested
    Interrupted(Progress),
}

/// Uniform interface over migration phases
#[async_trait]
pub trait PhaseDriver: Send + Sync {
    /// Driven phase
    fn phase(&self) -> MigrationPhase;

    /// Persisted progress of the phase
    async fn load_state(&self) -> Result<ProgressRecord, MigrationError>;

    /// Perform one bounded invocation
    async fn run_one_batch(
        &self,
        session: &LockSession,
        shutdown: &ShutdownSignal,
    ) -> Result<PhaseOutcome, MigrationError>;

    /// Check whether the phase finished
    async fn is_done(&self) -> Result<bool, MigrationError> {
        Ok(self.load_state().await?.done)
    }
}

#[async_trait]
impl<W: RangeWork> PhaseDriver for RangeBatchDriver<W> {
    fn phase(&self) -> MigrationPhase {
        self.work().phase()
    }

    async fn load_state(&self) -> Result<ProgressRecord, MigrationError> {
        Ok(self.tracker().load(self.phase()).await?)
    }

    async fn run_one_batch(
        &self,
        session: &LockSession,
        _shutdown: &ShutdownSignal,
    ) -> Result<PhaseOutcome, MigrationError> {
        let outcome = self.run_batch(session).await?;
        if outcome.done {
            Ok(PhaseOutcome::Done)
        } else {
            Ok(PhaseOutcome::InProgress(Progress::Cursor {
                cursor: outcome.cursor,
                high_water_mark: outcome.high_water_mark,
            }))
        }
    }
}

/// Bulk row rewrite over the relational store
pub struct RelationalMigration {
    store: Arc<dyn RelationalStore>,
}

impl RelationalMigration {
    /// Create over `store`
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RangeWork for RelationalMigration {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Relational
    }

    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.store.max_id().await
    }

    async fn process_range(&self, range: IdRange) -> Result<u64, StoreError> {
        self.store.update_range(range).await
    }
}

/// Per-entry rewrite over the versioned tree store
///
/// Each entry is rewritten with an explicit read-modify-write. An entry that
/// changed underneath the write is retried up to `conflict_retries` times
/// before the whole range fails.
pub struct TreeMigration {
    store: Arc<dyn TreeStore>,
    conflict_retries: u32,
}

impl TreeMigration {
    /// Create over `store`
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn TreeStore>, conflict_retries: u32) -> Self {
        Self {
            store,
            conflict_retries,
        }
    }

    async fn rewrite_with_retry(&self, id: i64) -> Result<bool, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.rewrite_entry(id).await {
                Err(StoreError::Conflict { .. }) if attempt < self.conflict_retries => {
                    attempt += 1;
                    tracing::debug!(id, attempt, "entry changed during rewrite; retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl RangeWork for TreeMigration {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Tree
    }

    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.store.max_id().await
    }

    async fn process_range(&self, range: IdRange) -> Result<u64, StoreError> {
        let ids = self.store.find_ids_needing_migration(range).await?;
        let mut rewritten = 0;
        for id in ids {
            if self.rewrite_with_retry(id).await? {
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}
