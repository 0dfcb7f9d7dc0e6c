//! CAM Engine - resumable content address migration
//!
//! Migrates content locators embedded in two node stores into a normalized
//! address table, then registers every blob nobody references as orphaned:
//!
//! 1. **Relational phase**: range-partitioned bulk row rewrites
//! 2. **Tree phase**: per-entry read-modify-write with conflict retries
//! 3. **Reconciliation**: streaming enumeration of the blob store
//!
//! All work happens under a cluster-wide lock and every step is recorded in
//! a progress registry, so a run can stop at any point and resume later on any
//! node.
//!
//! # Example
//!
//! ```rust,ignore
//! use cam_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     relational: Arc<dyn RelationalStore>,
//! #     tree: Arc<dyn TreeStore>,
//! #     blobs: Arc<dyn BlobStore>,
//! #     table: Arc<dyn AddressTable>,
//! # ) -> Result<(), MigrationError> {
//! let sequencer = MigrationSequencer::standard(
//!     MigrationConfig::new(),
//!     Arc::new(InMemoryLockCoordinator::new()),
//!     Arc::new(InMemoryRegistry::new()),
//!     relational,
//!     tree,
//!     blobs,
//!     table,
//!     ShutdownSignal::new(),
//! )?;
//! let status = sequencer.run(InvocationMode::OneShot).await;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod driver;
pub mod error;
pub mod memory;
pub mod phase;
pub mod reconcile;
pub mod sequencer;
pub mod store;

// Fault injection and simulation
pub mod test_harness;

// Re-exports
pub use driver::{plan_ranges, BatchOutcome, BatchSizing, RangeBatchDriver, RangeWork};
pub use error::{MigrationError, RangeFailure, StoreError};
pub use phase::{PhaseDriver, PhaseOutcome, Progress, RelationalMigration, TreeMigration};
pub use reconcile::{OrphanReconciler, ReconcileOutcome, ReconcileReport};
pub use sequencer::{MigrationSequencer, MigrationStatus, SequencerState};
pub use store::{
    AddressTable, AddressTransaction, BlobEntry, BlobStore, BlobStream, RelationalStore,
    SavepointId, TreeStore,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a migration
    pub use crate::{
        AddressTable, BlobStore, MigrationError, MigrationSequencer, MigrationStatus,
        PhaseDriver, RelationalStore, StoreError, TreeStore,
    };
    pub use cam_core::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
