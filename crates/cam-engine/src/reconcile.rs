//! Orphan reconciliation pass
//!
//! Walks every physical blob and registers the ones nobody owns as orphaned
//! rows in the address table. Runs only after both node stores are fully
//! migrated; otherwise owned addresses would look orphaned.
//!
//! The pass runs inside one long address-table transaction. Each insert is
//! wrapped in a savepoint so a unique violation (another path owns the address)
//! is rolled back without aborting the pass. Every `checkpoint_interval`
//! addresses the transaction is committed, the lock refreshed and the shutdown
//! signal polled. Stable-order blob stores also get their last committed
//! address persisted so an interrupted pass resumes where it stopped; other
//! stores restart from the beginning and rely on unique-violation tolerance.

use crate::error::{MigrationError, StoreError};
use crate::phase::{PhaseDriver, PhaseOutcome, Progress};
use crate::store::{AddressTable, AddressTransaction, BlobEntry, BlobStore};
use async_trait::async_trait;
use cam_core::{
    ContentAddress, LockSession, MigrationPhase, ProgressRecord, ProgressTracker, ShutdownSignal,
};
use futures::StreamExt;
use std::sync::Arc;

const PHASE: MigrationPhase = MigrationPhase::Reconciliation;
const PREREQUISITES: [MigrationPhase; 2] = [MigrationPhase::Relational, MigrationPhase::Tree];

/// Counters of one reconciliation invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Addresses produced by enumeration
    pub scanned: u64,
    /// Orphan rows inserted
    pub reconciled: u64,
    /// Addresses already present in the address table
    pub already_owned: u64,
    /// Addresses deleted before they could be checked
    pub vanished: u64,
    /// Bytes covered by the scanned addresses
    pub bytes_scanned: u64,
}

impl ReconcileReport {
    /// Percent of `total` bytes covered so far
    #[must_use]
    pub fn percent_of(&self, total: Option<u64>) -> Option<u8> {
        match total {
            Some(total) if total > 0 => {
                let percent = self.bytes_scanned.saturating_mul(100) / total;
                Some(percent.min(100) as u8)
            }
            _ => None,
        }
    }
}

/// How a reconciliation invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Node-store phases still running; nothing done
    NotReady {
        /// First unfinished prerequisite
        waiting_on: MigrationPhase,
    },
    /// Enumeration finished and the phase is marked done
    Complete(ReconcileReport),
    /// Shutdown requested; the phase stays open
    Incomplete(ReconcileReport),
}

enum EntryOutcome {
    Reconciled,
    AlreadyOwned,
    Vanished,
}

/// Orphan detection over a blob store
pub struct OrphanReconciler {
    blobs: Arc<dyn BlobStore>,
    table: Arc<dyn AddressTable>,
    tracker: ProgressTracker,
    checkpoint_interval: u64,
}

impl OrphanReconciler {
    /// Create a reconciler checkpointing every `checkpoint_interval` addresses
    #[must_use]
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        table: Arc<dyn AddressTable>,
        tracker: ProgressTracker,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            blobs,
            table,
            tracker,
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// Run the pass until enumeration ends or shutdown is requested
    ///
    /// # Errors
    /// - `MigrationError::Lock` if a checkpoint heartbeat fails
    /// - `MigrationError::Store` on enumeration or address table failures;
    ///   the open transaction is rolled back
    pub async fn run(
        &self,
        session: &LockSession,
        shutdown: &ShutdownSignal,
    ) -> Result<ReconcileOutcome, MigrationError> {
        for prerequisite in PREREQUISITES {
            if !self.tracker.load(prerequisite).await?.done {
                tracing::info!(waiting_on = %prerequisite, "reconciliation not ready");
                return Ok(ReconcileOutcome::NotReady {
                    waiting_on: prerequisite,
                });
            }
        }

        let mut report = ReconcileReport::default();
        if !self.blobs.supports_enumeration() {
            tracing::warn!("blob store cannot enumerate its content; skipping orphan reconciliation");
            self.tracker.mark_done(session, PHASE).await?;
            return Ok(ReconcileOutcome::Complete(report));
        }

        let stable = self.blobs.stable_order();
        let resume_after = if stable {
            self.tracker.last_address().await?
        } else {
            None
        };
        let total_bytes = match self.blobs.space_used().await {
            Ok(total) => total,
            Err(e) => {
                tracing::debug!(error = %e, "blob store size unknown");
                None
            }
        };
        tracing::info!(
            resume_after = resume_after.as_ref().map(ContentAddress::as_str),
            total_bytes,
            "starting orphan reconciliation"
        );

        session.refresh().await?;
        let mut stream = self.blobs.enumerate(resume_after);
        let mut txn = self.table.begin().await?;
        let mut since_checkpoint = 0u64;

        while let Some(entry) = stream.next().await {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    abandon(txn).await;
                    return Err(e.into());
                }
            };
            let outcome = match self.reconcile_entry(txn.as_mut(), &entry).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    abandon(txn).await;
                    return Err(e);
                }
            };

            report.scanned += 1;
            report.bytes_scanned += entry.size;
            match outcome {
                EntryOutcome::Reconciled => report.reconciled += 1,
                EntryOutcome::AlreadyOwned => report.already_owned += 1,
                EntryOutcome::Vanished => report.vanished += 1,
            }
            since_checkpoint += 1;

            if since_checkpoint < self.checkpoint_interval {
                continue;
            }
            since_checkpoint = 0;

            // Nothing commits unless the lock is still ours
            if let Err(e) = session.refresh().await {
                abandon(txn).await;
                return Err(e.into());
            }
            txn.commit().await?;
            if stable {
                self.tracker
                    .record_last_address(session, Some(&entry.address))
                    .await?;
            }
            tracing::info!(
                scanned = report.scanned,
                reconciled = report.reconciled,
                already_owned = report.already_owned,
                percent = report.percent_of(total_bytes),
                "reconciliation checkpoint"
            );

            if shutdown.is_requested() {
                tracing::info!(scanned = report.scanned, "reconciliation interrupted by shutdown");
                return Ok(ReconcileOutcome::Incomplete(report));
            }
            txn = self.table.begin().await?;
        }

        if let Err(e) = session.refresh().await {
            abandon(txn).await;
            return Err(e.into());
        }
        txn.commit().await?;
        self.tracker.mark_done(session, PHASE).await?;
        self.tracker.record_last_address(session, None).await?;
        tracing::info!(
            scanned = report.scanned,
            reconciled = report.reconciled,
            already_owned = report.already_owned,
            vanished = report.vanished,
            "orphan reconciliation complete"
        );
        Ok(ReconcileOutcome::Complete(report))
    }

    async fn reconcile_entry(
        &self,
        txn: &mut dyn AddressTransaction,
        entry: &BlobEntry,
    ) -> Result<EntryOutcome, MigrationError> {
        if !self.blobs.exists(&entry.address).await? {
            return Ok(EntryOutcome::Vanished);
        }

        let savepoint = txn.savepoint().await?;
        match txn.insert_orphaned(&entry.address).await {
            Ok(()) => {
                txn.release(savepoint).await?;
                tracing::debug!(address = %entry.address, "registered orphaned content");
                Ok(EntryOutcome::Reconciled)
            }
            Err(StoreError::UniqueViolation(_)) => {
                txn.rollback_to(savepoint).await?;
                Ok(EntryOutcome::AlreadyOwned)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn abandon(txn: Box<dyn AddressTransaction>) {
    if let Err(e) = txn.rollback().await {
        tracing::warn!(error = %e, "failed to roll back reconciliation transaction");
    }
}

#[async_trait]
impl PhaseDriver for OrphanReconciler {
    fn phase(&self) -> MigrationPhase {
        PHASE
    }

    async fn load_state(&self) -> Result<ProgressRecord, MigrationError> {
        Ok(self.tracker.load(PHASE).await?)
    }

    async fn run_one_batch(
        &self,
        session: &LockSession,
        shutdown: &ShutdownSignal,
    ) -> Result<PhaseOutcome, MigrationError> {
        if self.load_state().await?.done {
            return Ok(PhaseOutcome::Done);
        }
        match self.run(session, shutdown).await? {
            ReconcileOutcome::NotReady { waiting_on } => Ok(PhaseOutcome::NotReady { waiting_on }),
            ReconcileOutcome::Complete(_) => Ok(PhaseOutcome::Done),
            ReconcileOutcome::Incomplete(report) => {
                Ok(PhaseOutcome::Interrupted(Progress::Scanned {
                    addresses: report.scanned,
                    percent: None,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_of_known_total() {
        let report = ReconcileReport {
            bytes_scanned: 250,
            ..ReconcileReport::default()
        };
        assert_eq!(report.percent_of(Some(1_000)), Some(25));
        assert_eq!(report.percent_of(Some(100)), Some(100));
        assert_eq!(report.percent_of(Some(0)), None);
        assert_eq!(report.percent_of(None), None);
    }
}
