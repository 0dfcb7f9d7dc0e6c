//! CAM Core - Content Address Migration foundations
//!
//! Shared building blocks for the migration engine:
//! - Migration phases and persisted progress records
//! - The cluster-wide lock protocol (acquire / refresh / release)
//! - The progress registry that lets migration resume across restarts
//! - Configuration and the cooperative shutdown signal
//!
//! # Example
//!
//! ```rust,ignore
//! use cam_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::new().with_batch_size(500);
//! let locks: Arc<dyn LockCoordinator> = Arc::new(InMemoryLockCoordinator::new());
//!
//! if let Some(session) = LockSession::acquire(locks, &config.lock_resource, config.lock_ttl()).await? {
//!     let tracker = ProgressTracker::new(Arc::new(FileRegistry::open("progress.json")?));
//!     let record = tracker.load(MigrationPhase::Relational).await?;
//!     println!("{record}");
//!     session.release().await;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod lock;
pub mod registry;
pub mod shutdown;
pub mod types;

// Re-exports for convenience
pub use config::{MigrationConfig, DEFAULT_LOCK_RESOURCE};
pub use error::{ConfigError, LockError, RegistryError};
pub use lock::{InMemoryLockCoordinator, LockCoordinator, LockSession};
pub use registry::{
    FileRegistry, InMemoryRegistry, ProgressRegistry, ProgressTracker, RegistryValue,
    LAST_ADDRESS_KEY,
};
pub use shutdown::ShutdownSignal;
pub use types::{ContentAddress, IdRange, InvocationMode, LockHandle, MigrationPhase, ProgressRecord};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with CAM Core
    pub use crate::{
        ContentAddress, FileRegistry, IdRange, InMemoryLockCoordinator, InMemoryRegistry,
        InvocationMode, LockCoordinator, LockSession, MigrationConfig, MigrationPhase,
        ProgressRecord, ProgressRegistry, ProgressTracker, ShutdownSignal,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
