//! Testing utilities for CAM workspace
//!
//! Seeded in-memory systems and sequencer builders shared by the test suites.

#![allow(missing_docs)]

use cam_core::{
    ContentAddress, InMemoryLockCoordinator, InMemoryRegistry, LockCoordinator, LockSession,
    MigrationConfig, ProgressRegistry, ProgressTracker, ShutdownSignal,
};
use cam_engine::memory::{
    MemoryAddressTable, MemoryBlobStore, MemoryRelationalStore, MemoryTreeStore,
};
use cam_engine::{BlobStore, MigrationSequencer, RelationalStore, TreeStore};
use std::sync::Arc;

pub const TEST_RESOURCE: &str = "content-url-migration";

/// Every store and service a migration touches, all in memory
pub struct TestSystem {
    pub table: MemoryAddressTable,
    pub relational: Arc<MemoryRelationalStore>,
    pub tree: Arc<MemoryTreeStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub locks: Arc<InMemoryLockCoordinator>,
    pub registry: Arc<InMemoryRegistry>,
    pub shutdown: ShutdownSignal,
}

impl Default for TestSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_blobs(MemoryBlobStore::new())
    }

    pub fn with_blobs(blobs: MemoryBlobStore) -> Self {
        let table = MemoryAddressTable::new();
        Self {
            relational: Arc::new(MemoryRelationalStore::new(table.clone())),
            tree: Arc::new(MemoryTreeStore::new(table.clone())),
            table,
            blobs: Arc::new(blobs),
            locks: Arc::new(InMemoryLockCoordinator::new()),
            registry: Arc::new(InMemoryRegistry::new()),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Legacy rows `ids`, each referencing its own stored blob
    pub fn seed_relational(&self, ids: std::ops::Range<i64>) -> &Self {
        for id in ids {
            let url = relational_url(id);
            self.blobs.put(url.as_str(), 100);
            self.relational.insert_legacy(id, url);
        }
        self
    }

    /// Legacy tree entries `ids`, each referencing its own stored blob
    pub fn seed_tree(&self, ids: std::ops::Range<i64>) -> &Self {
        for id in ids {
            let url = tree_url(id);
            self.blobs.put(url.as_str(), 100);
            self.tree.insert_legacy(id, url);
        }
        self
    }

    /// Stored blobs nobody references
    pub fn seed_orphans(&self, addresses: &[&str]) -> &Self {
        for address in addresses {
            self.blobs.put(*address, 100);
        }
        self
    }

    pub fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(self.registry_dyn())
    }

    pub fn registry_dyn(&self) -> Arc<dyn ProgressRegistry> {
        self.registry.clone()
    }

    pub fn locks_dyn(&self) -> Arc<dyn LockCoordinator> {
        self.locks.clone()
    }

    /// Hold the migration lock as the test itself
    pub async fn lock(&self) -> LockSession {
        LockSession::acquire(self.locks_dyn(), TEST_RESOURCE, test_config().lock_ttl())
            .await
            .unwrap()
            .expect("migration lock already held")
    }

    /// Standard sequencer over this system's stores
    pub fn sequencer(&self, config: MigrationConfig) -> MigrationSequencer {
        let relational: Arc<dyn RelationalStore> = self.relational.clone();
        let tree: Arc<dyn TreeStore> = self.tree.clone();
        let blobs: Arc<dyn BlobStore> = self.blobs.clone();
        self.sequencer_over(config, relational, tree, blobs)
    }

    /// Standard sequencer with some stores replaced, e.g. by fault injectors
    pub fn sequencer_over(
        &self,
        config: MigrationConfig,
        relational: Arc<dyn RelationalStore>,
        tree: Arc<dyn TreeStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> MigrationSequencer {
        MigrationSequencer::standard(
            config,
            self.locks_dyn(),
            self.registry_dyn(),
            relational,
            tree,
            blobs,
            Arc::new(self.table.clone()),
            self.shutdown.clone(),
        )
        .expect("invalid test configuration")
    }
}

pub fn relational_url(id: i64) -> String {
    format!("blob://rel/{id}")
}

pub fn tree_url(id: i64) -> String {
    format!("blob://tree/{id}")
}

pub fn address(s: &str) -> ContentAddress {
    ContentAddress::new(s)
}

/// Small, sequential configuration
pub fn test_config() -> MigrationConfig {
    MigrationConfig::new()
        .with_lock_resource(TEST_RESOURCE)
        .with_batch_size(100)
        .with_thread_count(1)
        .with_ranges_per_thread(1)
        .with_checkpoint_interval(1)
}
