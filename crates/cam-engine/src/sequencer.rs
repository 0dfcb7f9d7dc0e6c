//! Phase sequencer
//!
//! Entry point of a migration run:
//!
//! ```text
//! START --lock--> RELATIONAL --> TREE --> RECONCILIATION --> DONE
//!   |                  \___________\____________\________--> FAILED
//!   +--lock busy (tick)--> WAITING
//! ```
//!
//! The lock is released on every path once acquired.

use crate::driver::{BatchSizing, RangeBatchDriver};
use crate::error::MigrationError;
use crate::phase::{PhaseDriver, PhaseOutcome, Progress, RelationalMigration, TreeMigration};
use crate::reconcile::OrphanReconciler;
use crate::store::{AddressTable, BlobStore, RelationalStore, TreeStore};
use cam_core::{
    InvocationMode, LockCoordinator, LockSession, MigrationConfig, MigrationPhase,
    ProgressRegistry, ProgressTracker, ShutdownSignal,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Sequencer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Not yet invoked, or between invocations
    Start,
    /// Lock held elsewhere; try again later
    Waiting,
    /// Driving a phase
    Running(MigrationPhase),
    /// Every phase finished
    Done,
    /// Last invocation aborted
    Failed,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerState::Start => write!(f, "start"),
            SequencerState::Waiting => write!(f, "waiting"),
            SequencerState::Running(phase) => write!(f, "running {phase}"),
            SequencerState::Done => write!(f, "done"),
            SequencerState::Failed => write!(f, "failed"),
        }
    }
}

/// Operator-visible outcome of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Another node holds the lock
    Bypassed {
        /// Lock name
        resource: String,
    },
    /// Bounded invocation finished with work remaining
    InProgress {
        /// First unfinished phase
        phase: MigrationPhase,
        /// Its position
        progress: Progress,
    },
    /// Shutdown requested before completion
    Incomplete {
        /// Phase that was interrupted
        phase: MigrationPhase,
        /// Its position
        progress: Progress,
    },
    /// Every phase finished
    Done,
    /// Invocation aborted; nothing past the last successful batch persisted
    Failed {
        /// Phase being driven, if any
        phase: Option<MigrationPhase>,
        /// Error message
        error: String,
    },
}

impl MigrationStatus {
    /// Migration finished
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Invocation aborted
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn failed(phase: Option<MigrationPhase>, error: &MigrationError) -> Self {
        Self::Failed {
            phase,
            error: error.to_string(),
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bypassed { resource } => write!(
                f,
                "bypassed: migration lock `{resource}` is held by another node"
            ),
            Self::InProgress { phase, progress } => write!(f, "in progress: {phase} {progress}"),
            Self::Incomplete { phase, progress } => write!(
                f,
                "incomplete: shutdown requested during {phase} ({progress})"
            ),
            Self::Done => write!(f, "done: content addresses migrated and reconciled"),
            Self::Failed {
                phase: Some(phase),
                error,
            } => write!(f, "failed during {phase}: {error}"),
            Self::Failed { phase: None, error } => write!(f, "failed: {error}"),
        }
    }
}

/// Orchestrates the phases of a migration under the cluster lock
pub struct MigrationSequencer {
    config: MigrationConfig,
    locks: Arc<dyn LockCoordinator>,
    tracker: ProgressTracker,
    phases: Vec<Box<dyn PhaseDriver>>,
    shutdown: ShutdownSignal,
    state: Mutex<SequencerState>,
}

impl fmt::Debug for MigrationSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSequencer")
            .field("config", &self.config)
            .field(
                "phases",
                &self.phases.iter().map(|p| p.phase()).collect::<Vec<_>>(),
            )
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl MigrationSequencer {
    /// Create a sequencer with no phases
    ///
    /// # Errors
    /// `MigrationError::Config` if `config` fails validation
    pub fn new(
        config: MigrationConfig,
        locks: Arc<dyn LockCoordinator>,
        registry: Arc<dyn ProgressRegistry>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        Ok(Self {
            config,
            locks,
            tracker: ProgressTracker::new(registry),
            phases: Vec::new(),
            shutdown,
            state: Mutex::new(SequencerState::Start),
        })
    }

    /// Create a sequencer with the standard relational, tree and
    /// reconciliation phases
    ///
    /// # Errors
    /// `MigrationError::Config` if `config` fails validation
    #[allow(clippy::too_many_arguments)]
    pub fn standard(
        config: MigrationConfig,
        locks: Arc<dyn LockCoordinator>,
        registry: Arc<dyn ProgressRegistry>,
        relational: Arc<dyn RelationalStore>,
        tree: Arc<dyn TreeStore>,
        blobs: Arc<dyn BlobStore>,
        table: Arc<dyn AddressTable>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        let tracker = ProgressTracker::new(Arc::clone(&registry));
        let sizing = BatchSizing::from(&config);
        let relational = RangeBatchDriver::new(
            RelationalMigration::new(relational),
            tracker.clone(),
            sizing,
        );
        let tree = RangeBatchDriver::new(
            TreeMigration::new(tree, config.conflict_retries),
            tracker.clone(),
            sizing,
        );
        let reconcile =
            OrphanReconciler::new(blobs, table, tracker, config.checkpoint_interval());

        Ok(Self::new(config, locks, registry, shutdown)?
            .with_phase(Box::new(relational))
            .with_phase(Box::new(tree))
            .with_phase(Box::new(reconcile)))
    }

    /// Append a phase; phases run in insertion order
    #[must_use]
    pub fn with_phase(mut self, phase: Box<dyn PhaseDriver>) -> Self {
        self.phases.push(phase);
        self
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Progress tracker
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> SequencerState {
        *self.state.lock()
    }

    /// Run in the mode implied by the configuration
    pub async fn run_configured(&self) -> MigrationStatus {
        self.run(self.config.default_mode()).await
    }

    /// Run one invocation
    ///
    /// Never returns an error: failures are logged and reported as
    /// [`MigrationStatus::Failed`] after the lock has been released.
    pub async fn run(&self, mode: InvocationMode) -> MigrationStatus {
        let resource = self.config.lock_resource.clone();
        tracing::info!(%mode, %resource, "content address migration invoked");
        self.transition(SequencerState::Start);

        let acquired =
            LockSession::acquire(Arc::clone(&self.locks), &resource, self.config.lock_ttl()).await;
        let session = match acquired {
            Ok(Some(session)) => session,
            Ok(None) => {
                return match mode {
                    InvocationMode::ScheduledTick => {
                        tracing::info!(%resource, "migration lock held elsewhere; bypassing");
                        self.transition(SequencerState::Waiting);
                        MigrationStatus::Bypassed { resource }
                    }
                    InvocationMode::OneShot => {
                        let error = MigrationError::LockUnavailable { resource };
                        tracing::error!(%error, "one-shot migration could not obtain exclusivity");
                        self.transition(SequencerState::Failed);
                        MigrationStatus::failed(None, &error)
                    }
                };
            }
            Err(e) => {
                let error = MigrationError::from(e);
                tracing::error!(%error, "migration lock service failed");
                self.transition(SequencerState::Failed);
                return MigrationStatus::failed(None, &error);
            }
        };

        let status = self.drive(&session, mode).await;
        session.release().await;

        match &status {
            MigrationStatus::Done => self.transition(SequencerState::Done),
            MigrationStatus::Failed { .. } => self.transition(SequencerState::Failed),
            _ => self.transition(SequencerState::Start),
        }
        tracing::info!(%status, "content address migration invocation finished");
        status
    }

    async fn drive(&self, session: &LockSession, mode: InvocationMode) -> MigrationStatus {
        let mut pending: Option<(MigrationPhase, Progress)> = None;

        for driver in &self.phases {
            let phase = driver.phase();
            self.transition(SequencerState::Running(phase));

            loop {
                if self.shutdown.is_requested() {
                    let progress = self.position(driver.as_ref()).await;
                    tracing::info!(%phase, "shutdown requested; stopping before next batch");
                    return MigrationStatus::Incomplete { phase, progress };
                }
                if let Err(e) = session.refresh().await {
                    return self.abort(phase, &e.into());
                }

                match driver.run_one_batch(session, &self.shutdown).await {
                    Ok(PhaseOutcome::Done) => break,
                    Ok(PhaseOutcome::InProgress(progress)) => match mode {
                        InvocationMode::OneShot => {}
                        InvocationMode::ScheduledTick => {
                            pending.get_or_insert((phase, progress));
                            break;
                        }
                    },
                    Ok(PhaseOutcome::NotReady { waiting_on }) => match mode {
                        InvocationMode::ScheduledTick => {
                            pending.get_or_insert((waiting_on, Progress::NotStarted));
                            break;
                        }
                        InvocationMode::OneShot => {
                            let error = MigrationError::NotReady { phase, waiting_on };
                            return self.abort(phase, &error);
                        }
                    },
                    Ok(PhaseOutcome::Interrupted(progress)) => {
                        return MigrationStatus::Incomplete { phase, progress };
                    }
                    Err(e) => return self.abort(phase, &e),
                }
            }
        }

        match pending {
            Some((phase, progress)) => MigrationStatus::InProgress { phase, progress },
            None => MigrationStatus::Done,
        }
    }

    async fn position(&self, driver: &dyn PhaseDriver) -> Progress {
        match driver.load_state().await {
            Ok(record) => match (record.cursor, record.high_water_mark()) {
                (Some(cursor), Some(high_water_mark)) => Progress::Cursor {
                    cursor,
                    high_water_mark,
                },
                _ => Progress::NotStarted,
            },
            Err(_) => Progress::NotStarted,
        }
    }

    fn abort(&self, phase: MigrationPhase, error: &MigrationError) -> MigrationStatus {
        if error.is_lock_lost() {
            tracing::error!(%phase, %error, "migration lock lost; abandoning invocation");
        } else {
            tracing::error!(%phase, %error, retryable = error.is_retryable(), "migration invocation failed");
        }
        MigrationStatus::failed(Some(phase), error)
    }

    fn transition(&self, to: SequencerState) {
        let mut state = self.state.lock();
        if *state != to {
            tracing::debug!(from = %*state, %to, "sequencer transition");
            *state = to;
        }
    }
}
