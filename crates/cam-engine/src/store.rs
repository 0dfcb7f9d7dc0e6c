//! External store interfaces
//!
//! The engine treats every store as an opaque service. Implementations own
//! their transaction boundaries: each call documented as a unit of work must
//! commit or fail as a whole.

use crate::error::StoreError;
use async_trait::async_trait;
use cam_core::{ContentAddress, IdRange};
use futures::stream::BoxStream;

/// Relational node store holding content locators in table rows
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Highest row id, `None` when the table is empty
    async fn max_id(&self) -> Result<Option<i64>, StoreError>;

    /// Rewrite every legacy-encoded row in `range` into the normalized form
    ///
    /// Runs in its own transaction and is idempotent. Returns the number of
    /// rows actually rewritten.
    async fn update_range(&self, range: IdRange) -> Result<u64, StoreError>;
}

/// Versioned tree store holding content locators on individual entries
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Highest entry id, `None` when the store is empty
    async fn max_id(&self) -> Result<Option<i64>, StoreError>;

    /// Ids in `range` whose entries still carry a legacy locator
    async fn find_ids_needing_migration(&self, range: IdRange) -> Result<Vec<i64>, StoreError>;

    /// Read-modify-write of one entry into the normalized form
    ///
    /// Idempotent. Returns `false` when the entry was already normalized and
    /// [`StoreError::Conflict`] when the entry changed underneath the write.
    async fn rewrite_entry(&self, id: i64) -> Result<bool, StoreError>;
}

/// One physical blob reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Blob locator
    pub address: ContentAddress,
    /// Size in bytes
    pub size: u64,
}

/// Stream of blobs produced by [`BlobStore::enumerate`]
pub type BlobStream<'a> = BoxStream<'a, Result<BlobEntry, StoreError>>;

/// Physical content store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Total bytes stored, `None` when unknown
    async fn space_used(&self) -> Result<Option<u64>, StoreError>;

    /// Whether the store can list its content at all
    fn supports_enumeration(&self) -> bool {
        true
    }

    /// Whether enumeration always yields addresses in the same ascending order
    ///
    /// Only stable-order stores can resume enumeration after a given address.
    fn stable_order(&self) -> bool {
        false
    }

    /// Stream every blob, starting after `after` when the order is stable
    fn enumerate(&self, after: Option<ContentAddress>) -> BlobStream<'_>;

    /// Check whether `address` still resolves to data
    async fn exists(&self, address: &ContentAddress) -> Result<bool, StoreError>;
}

/// Savepoint marker inside an [`AddressTransaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavepointId(pub u64);

/// Normalized address table
#[async_trait]
pub trait AddressTable: Send + Sync {
    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn AddressTransaction>, StoreError>;
}

/// Long-running transaction over the address table with nested savepoints
#[async_trait]
pub trait AddressTransaction: Send {
    /// Mark a point that can be rolled back without aborting the transaction
    async fn savepoint(&mut self) -> Result<SavepointId, StoreError>;

    /// Insert an orphaned row for `address`
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the address is already
    /// present, owned or orphaned.
    async fn insert_orphaned(&mut self, address: &ContentAddress) -> Result<(), StoreError>;

    /// Undo everything since `savepoint`
    async fn rollback_to(&mut self, savepoint: SavepointId) -> Result<(), StoreError>;

    /// Keep everything since `savepoint`
    async fn release(&mut self, savepoint: SavepointId) -> Result<(), StoreError>;

    /// Make the transaction durable
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Abandon the transaction
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
