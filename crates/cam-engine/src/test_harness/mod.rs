//! Fault injection and end-to-end simulation
//!
//! Used by the `cam-migrate simulate` command and by the integration tests.

pub mod faults;
pub mod simulator;

pub use faults::{
    ConflictingTreeStore, FailureMode, FlakyRelationalStore, InterruptingBlobStore,
    SlowBlobStore, VanishingBlobStore,
};
pub use simulator::{run_simulator, SimulationReport, SimulatorConfig, SimulatorStats, Violation};
