//! Migration simulator
//!
//! Seeds in-memory stores with legacy content, then drives the sequencer with
//! scheduled ticks the way a cluster scheduler would, while injecting range
//! failures, tree entry conflicts, process restarts and new-format writes.
//!
//! Invariants checked at the end:
//! - No legacy locator survives in either node store
//! - Every unreferenced blob has exactly one orphaned row
//! - No referenced blob is marked orphaned
//! - Cursors never move backwards between ticks
//! - Entities written after migration started are left untouched

use super::faults::{ConflictingTreeStore, FlakyRelationalStore};
use crate::error::MigrationError;
use crate::memory::{
    ContentLocator, MemoryAddressTable, MemoryBlobStore, MemoryRelationalStore, MemoryTreeStore,
};
use crate::sequencer::{MigrationSequencer, MigrationStatus};
use crate::store::{BlobStore, RelationalStore, TreeStore};
use cam_core::{
    ContentAddress, InMemoryLockCoordinator, InMemoryRegistry, InvocationMode, LockCoordinator,
    MigrationConfig, MigrationPhase, ProgressRegistry, ShutdownSignal,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Legacy rows in the relational store
    pub relational_rows: i64,
    /// Legacy entries in the tree store
    pub tree_entries: i64,
    /// Blobs nobody references
    pub orphans: usize,
    /// Probability that a relational range fails
    pub failure_rate: f64,
    /// Probability that a tree entry rewrite conflicts
    pub conflict_rate: f64,
    /// Probability of a simulated restart before a tick
    pub restart_rate: f64,
    /// Probability of a new-format write before a tick
    pub write_rate: f64,
    /// Give up after this many ticks
    pub max_ticks: u32,
    /// Engine configuration
    pub migration: MigrationConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            relational_rows: 2_500,
            tree_entries: 1_200,
            orphans: 40,
            failure_rate: 0.05,
            conflict_rate: 0.1,
            restart_rate: 0.1,
            write_rate: 0.2,
            max_ticks: 500,
            migration: MigrationConfig::new()
                .with_batch_size(100)
                .with_thread_count(4)
                .with_ranges_per_thread(2)
                .with_checkpoint_interval(16)
                .with_conflict_retries(2),
        }
    }
}

/// A broken invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Legacy locators remain after completion
    LegacyRemaining {
        /// Phase whose store still has them
        phase: MigrationPhase,
        /// How many
        count: usize,
    },
    /// Unreferenced blob without an orphaned row
    OrphanMissed {
        /// Blob left unregistered
        address: ContentAddress,
    },
    /// Referenced blob marked orphaned
    OwnedMarkedOrphan {
        /// Blob wrongly orphaned
        address: ContentAddress,
    },
    /// Cursor moved backwards
    CursorRegressed {
        /// Phase
        phase: MigrationPhase,
        /// Previous value
        from: i64,
        /// New value
        to: i64,
    },
    /// Post-start write was rewritten
    NewWriteTouched {
        /// Row id
        id: i64,
    },
    /// Migration did not finish within the tick budget
    NotFinished {
        /// Last status
        status: String,
    },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub ticks: u32,
    pub restarts: u32,
    pub failed_ticks: u32,
    pub bypassed_ticks: u32,
    pub new_writes: u32,
    pub orphans_found: usize,
}

/// Final report from simulator
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
    pub final_status: MigrationStatus,
}

impl SimulationReport {
    /// Check if every invariant held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "=== Content Address Migration Simulation ===");
        let _ = writeln!(text, "Seed: {}", self.config.seed);
        let _ = writeln!(
            text,
            "Relational rows: {}, tree entries: {}, orphans: {}",
            self.config.relational_rows, self.config.tree_entries, self.config.orphans
        );
        let _ = writeln!(text, "Ticks: {}", self.stats.ticks);
        let _ = writeln!(text, "Restarts: {}", self.stats.restarts);
        let _ = writeln!(text, "Failed ticks: {}", self.stats.failed_ticks);
        let _ = writeln!(text, "Bypassed ticks: {}", self.stats.bypassed_ticks);
        let _ = writeln!(text, "New-format writes: {}", self.stats.new_writes);
        let _ = writeln!(text, "Orphans registered: {}", self.stats.orphans_found);
        let _ = writeln!(text, "Final status: {}", self.final_status);

        if !self.violations.is_empty() {
            let _ = writeln!(text, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(text, "{}. {v:?}", i + 1);
            }
        }
        let _ = writeln!(
            text,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        text
    }
}

struct World {
    table: MemoryAddressTable,
    relational: Arc<MemoryRelationalStore>,
    tree: Arc<MemoryTreeStore>,
    blobs: Arc<MemoryBlobStore>,
    flaky: Arc<FlakyRelationalStore>,
    conflicting: Arc<ConflictingTreeStore>,
    referenced: BTreeSet<ContentAddress>,
    orphans: BTreeSet<ContentAddress>,
}

impl World {
    fn seed(config: &SimulatorConfig, rng: &mut StdRng) -> Self {
        let table = MemoryAddressTable::new();
        let relational = Arc::new(MemoryRelationalStore::new(table.clone()));
        let tree = Arc::new(MemoryTreeStore::new(table.clone()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut referenced = BTreeSet::new();
        let mut orphans = BTreeSet::new();

        for id in 0..config.relational_rows {
            let url = format!("store://rel/{id:06}");
            blobs.put(url.as_str(), rng.gen_range(1..4_096));
            relational.insert_legacy(id, url.as_str());
            referenced.insert(ContentAddress::new(url));
        }
        for id in 0..config.tree_entries {
            let url = format!("store://tree/{id:06}");
            blobs.put(url.as_str(), rng.gen_range(1..4_096));
            tree.insert_legacy(id, url.as_str());
            referenced.insert(ContentAddress::new(url));
        }
        for n in 0..config.orphans {
            let address = ContentAddress::new(format!("store://orphan/{n:06}"));
            blobs.put(address.clone(), rng.gen_range(1..4_096));
            orphans.insert(address);
        }

        let inner: Arc<dyn RelationalStore> = relational.clone();
        let flaky = Arc::new(
            FlakyRelationalStore::new(inner).with_failure_rate(config.failure_rate, rng.gen()),
        );
        let conflicting = Arc::new(
            ConflictingTreeStore::new(Arc::clone(&tree), 0)
                .with_conflict_rate(config.conflict_rate, rng.gen()),
        );

        Self {
            table,
            relational,
            tree,
            blobs,
            flaky,
            conflicting,
            referenced,
            orphans,
        }
    }

    // A restart keeps the stores, the registry and the lock service
    fn sequencer(
        &self,
        config: &MigrationConfig,
        locks: &Arc<dyn LockCoordinator>,
        registry: &Arc<dyn ProgressRegistry>,
    ) -> Result<MigrationSequencer, MigrationError> {
        let relational: Arc<dyn RelationalStore> = self.flaky.clone();
        let tree: Arc<dyn TreeStore> = self.conflicting.clone();
        let blobs: Arc<dyn BlobStore> = self.blobs.clone();
        MigrationSequencer::standard(
            config.clone(),
            Arc::clone(locks),
            Arc::clone(registry),
            relational,
            tree,
            blobs,
            Arc::new(self.table.clone()),
            ShutdownSignal::new(),
        )
    }
}

/// Run the simulator
///
/// # Errors
/// `MigrationError::Config` if the migration configuration is invalid
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulationReport, MigrationError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let world = World::seed(&config, &mut rng);
    let locks: Arc<dyn LockCoordinator> = Arc::new(InMemoryLockCoordinator::new());
    let registry: Arc<dyn ProgressRegistry> = Arc::new(InMemoryRegistry::new());

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();
    let mut cursors: HashMap<MigrationPhase, i64> = HashMap::new();
    let mut new_writes: Vec<(i64, Option<ContentLocator>)> = Vec::new();
    let mut next_new_id = config.relational_rows + 1_000_000;

    let mut sequencer = world.sequencer(&config.migration, &locks, &registry)?;
    let mut status = MigrationStatus::InProgress {
        phase: MigrationPhase::Relational,
        progress: crate::phase::Progress::NotStarted,
    };

    while stats.ticks < config.max_ticks {
        if stats.ticks > 0 && rng.gen_bool(config.restart_rate.clamp(0.0, 1.0)) {
            tracing::debug!(tick = stats.ticks, "simulated restart");
            sequencer = world.sequencer(&config.migration, &locks, &registry)?;
            stats.restarts += 1;
        }
        if stats.ticks > 0 && rng.gen_bool(config.write_rate.clamp(0.0, 1.0)) {
            let address = ContentAddress::new(format!("store://new/{next_new_id:08}"));
            world.blobs.put(address.clone(), rng.gen_range(1..4_096));
            world.relational.insert_normalized(next_new_id, &address);
            new_writes.push((next_new_id, world.relational.locator(next_new_id)));
            next_new_id += 1;
            stats.new_writes += 1;
        }

        status = sequencer.run(InvocationMode::ScheduledTick).await;
        stats.ticks += 1;
        match &status {
            MigrationStatus::Failed { .. } => stats.failed_ticks += 1,
            MigrationStatus::Bypassed { .. } => stats.bypassed_ticks += 1,
            _ => {}
        }

        if let Ok(records) = sequencer.tracker().load_all().await {
            for record in records {
                let Some(cursor) = record.cursor else { continue };
                if let Some(previous) = cursors.insert(record.phase, cursor) {
                    if cursor < previous {
                        violations.push(Violation::CursorRegressed {
                            phase: record.phase,
                            from: previous,
                            to: cursor,
                        });
                    }
                }
            }
        }

        if status.is_done() {
            break;
        }
    }

    if !status.is_done() {
        violations.push(Violation::NotFinished {
            status: status.to_string(),
        });
    }
    check_final_state(&world, &new_writes, &mut stats, &mut violations);

    Ok(SimulationReport {
        config,
        stats,
        violations,
        final_status: status,
    })
}

fn check_final_state(
    world: &World,
    new_writes: &[(i64, Option<ContentLocator>)],
    stats: &mut SimulatorStats,
    violations: &mut Vec<Violation>,
) {
    let legacy = [
        (MigrationPhase::Relational, world.relational.legacy_count()),
        (MigrationPhase::Tree, world.tree.legacy_count()),
    ];
    for (phase, count) in legacy {
        if count > 0 {
            violations.push(Violation::LegacyRemaining { phase, count });
        }
    }

    let found: BTreeSet<ContentAddress> = world.table.orphans().into_iter().collect();
    stats.orphans_found = found.len();
    for address in world.orphans.difference(&found) {
        violations.push(Violation::OrphanMissed {
            address: address.clone(),
        });
    }
    for address in found.intersection(&world.referenced) {
        violations.push(Violation::OwnedMarkedOrphan {
            address: address.clone(),
        });
    }

    for (id, locator) in new_writes {
        if world.relational.locator(*id) != *locator {
            violations.push(Violation::NewWriteTouched { id: *id });
        }
    }
}
