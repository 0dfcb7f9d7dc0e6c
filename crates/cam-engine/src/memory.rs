//! In-memory stores
//!
//! Reference implementations of the store interfaces used by the simulator,
//! the `cam-migrate` demo commands and the test suites. Normalizing a legacy
//! locator registers its address as owned in a shared [`MemoryAddressTable`],
//! so after both node-store phases every referenced blob has an owned row and
//! reconciliation only has the unreferenced ones left to orphan.

use crate::error::StoreError;
use crate::store::{
    AddressTable, AddressTransaction, BlobEntry, BlobStore, BlobStream, RelationalStore,
    SavepointId, TreeStore,
};
use async_trait::async_trait;
use cam_core::{ContentAddress, IdRange};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Content locator as stored on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLocator {
    /// Pre-migration embedded URL
    Legacy(String),
    /// Reference to an address-table row id
    Normalized(i64),
}

/// One row of the address table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    /// Row id
    pub id: i64,
    /// Row marks content nobody references
    pub orphaned: bool,
}

#[derive(Debug, Default)]
struct AddressRows {
    rows: BTreeMap<ContentAddress, AddressRow>,
    next_id: i64,
}

impl AddressRows {
    fn insert(&mut self, address: ContentAddress, orphaned: bool) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.insert(address, AddressRow { id, orphaned });
        id
    }
}

/// Address table with savepoint-capable transactions
#[derive(Debug, Clone, Default)]
pub struct MemoryAddressTable {
    inner: Arc<Mutex<AddressRows>>,
    commits: Arc<AtomicU64>,
}

impl MemoryAddressTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the owned row for `address`, inserting it when missing
    pub fn ensure_owned(&self, address: &ContentAddress) -> i64 {
        let mut inner = self.inner.lock();
        match inner.rows.get(address) {
            Some(row) => row.id,
            None => inner.insert(address.clone(), false),
        }
    }

    /// Row for `address`
    #[must_use]
    pub fn row(&self, address: &ContentAddress) -> Option<AddressRow> {
        self.inner.lock().rows.get(address).cloned()
    }

    /// Addresses of every orphaned row, ascending
    #[must_use]
    pub fn orphans(&self) -> Vec<ContentAddress> {
        self.inner
            .lock()
            .rows
            .iter()
            .filter(|(_, row)| row.orphaned)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Table holds no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transactions committed so far
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressTable for MemoryAddressTable {
    async fn begin(&self) -> Result<Box<dyn AddressTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            table: self.clone(),
            pending: Vec::new(),
            savepoints: Vec::new(),
            next_savepoint: 0,
        }))
    }
}

struct MemoryTransaction {
    table: MemoryAddressTable,
    pending: Vec<ContentAddress>,
    // savepoint id and the pending length when it was taken
    savepoints: Vec<(SavepointId, usize)>,
    next_savepoint: u64,
}

impl MemoryTransaction {
    fn position(&self, savepoint: SavepointId) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .position(|(id, _)| *id == savepoint)
            .ok_or_else(|| StoreError::Backend(format!("unknown savepoint {}", savepoint.0)))
    }
}

#[async_trait]
impl AddressTransaction for MemoryTransaction {
    async fn savepoint(&mut self) -> Result<SavepointId, StoreError> {
        self.next_savepoint += 1;
        let id = SavepointId(self.next_savepoint);
        self.savepoints.push((id, self.pending.len()));
        Ok(id)
    }

    async fn insert_orphaned(&mut self, address: &ContentAddress) -> Result<(), StoreError> {
        let committed = self.table.inner.lock().rows.contains_key(address);
        if committed || self.pending.contains(address) {
            return Err(StoreError::UniqueViolation(address.clone()));
        }
        self.pending.push(address.clone());
        Ok(())
    }

    async fn rollback_to(&mut self, savepoint: SavepointId) -> Result<(), StoreError> {
        let index = self.position(savepoint)?;
        let (_, len) = self.savepoints[index];
        self.pending.truncate(len);
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn release(&mut self, savepoint: SavepointId) -> Result<(), StoreError> {
        let index = self.position(savepoint)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.table.inner.lock();
        for address in self.pending {
            // an owner registered after our insert wins
            if !inner.rows.contains_key(&address) {
                inner.insert(address, true);
            }
        }
        self.table.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Relational node store
#[derive(Debug)]
pub struct MemoryRelationalStore {
    rows: Mutex<BTreeMap<i64, ContentLocator>>,
    table: MemoryAddressTable,
}

impl MemoryRelationalStore {
    /// Create an empty store registering addresses in `table`
    #[must_use]
    pub fn new(table: MemoryAddressTable) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            table,
        }
    }

    /// Insert a row carrying a legacy locator
    pub fn insert_legacy(&self, id: i64, url: impl Into<String>) {
        self.rows.lock().insert(id, ContentLocator::Legacy(url.into()));
    }

    /// Insert a row written directly in the normalized form
    pub fn insert_normalized(&self, id: i64, address: &ContentAddress) {
        let row_id = self.table.ensure_owned(address);
        self.rows.lock().insert(id, ContentLocator::Normalized(row_id));
    }

    /// Locator of row `id`
    #[must_use]
    pub fn locator(&self, id: i64) -> Option<ContentLocator> {
        self.rows.lock().get(&id).cloned()
    }

    /// Rows still carrying a legacy locator
    #[must_use]
    pub fn legacy_count(&self) -> usize {
        self.rows
            .lock()
            .values()
            .filter(|locator| matches!(locator, ContentLocator::Legacy(_)))
            .count()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.rows.lock().keys().next_back().copied())
    }

    async fn update_range(&self, range: IdRange) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock();
        let mut rewritten = 0;
        for locator in rows.range_mut(range.start..range.end).map(|(_, l)| l) {
            if let ContentLocator::Legacy(url) = locator {
                let row_id = self.table.ensure_owned(&ContentAddress::new(url.as_str()));
                *locator = ContentLocator::Normalized(row_id);
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}

#[derive(Debug, Clone)]
struct TreeEntry {
    locator: ContentLocator,
    version: u64,
}

/// Versioned tree node store
///
/// [`TreeStore::rewrite_entry`] reads the entry, yields, then writes it back
/// only if the version did not move. [`MemoryTreeStore::touch`] bumps a version
/// the way a concurrent writer would.
#[derive(Debug)]
pub struct MemoryTreeStore {
    entries: Mutex<BTreeMap<i64, TreeEntry>>,
    table: MemoryAddressTable,
}

impl MemoryTreeStore {
    /// Create an empty store registering addresses in `table`
    #[must_use]
    pub fn new(table: MemoryAddressTable) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            table,
        }
    }

    /// Insert an entry carrying a legacy locator
    pub fn insert_legacy(&self, id: i64, url: impl Into<String>) {
        self.entries.lock().insert(
            id,
            TreeEntry {
                locator: ContentLocator::Legacy(url.into()),
                version: 0,
            },
        );
    }

    /// Insert an entry written directly in the normalized form
    pub fn insert_normalized(&self, id: i64, address: &ContentAddress) {
        let row_id = self.table.ensure_owned(address);
        self.entries.lock().insert(
            id,
            TreeEntry {
                locator: ContentLocator::Normalized(row_id),
                version: 0,
            },
        );
    }

    /// Simulate a concurrent write to entry `id`
    pub fn touch(&self, id: i64) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.version += 1;
        }
    }

    /// Locator of entry `id`
    #[must_use]
    pub fn locator(&self, id: i64) -> Option<ContentLocator> {
        self.entries.lock().get(&id).map(|e| e.locator.clone())
    }

    /// Version of entry `id`
    #[must_use]
    pub fn version(&self, id: i64) -> Option<u64> {
        self.entries.lock().get(&id).map(|e| e.version)
    }

    /// Entries still carrying a legacy locator
    #[must_use]
    pub fn legacy_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| matches!(e.locator, ContentLocator::Legacy(_)))
            .count()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.entries.lock().keys().next_back().copied())
    }

    async fn find_ids_needing_migration(&self, range: IdRange) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .entries
            .lock()
            .range(range.start..range.end)
            .filter(|(_, e)| matches!(e.locator, ContentLocator::Legacy(_)))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn rewrite_entry(&self, id: i64) -> Result<bool, StoreError> {
        let read = self.entries.lock().get(&id).cloned();
        let Some(TreeEntry {
            locator: ContentLocator::Legacy(url),
            version,
        }) = read
        else {
            return Ok(false);
        };

        tokio::task::yield_now().await;
        let row_id = self.table.ensure_owned(&ContentAddress::new(url));

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(false);
        };
        if entry.version != version {
            return Err(StoreError::Conflict { id });
        }
        if matches!(entry.locator, ContentLocator::Normalized(_)) {
            return Ok(false);
        }
        entry.locator = ContentLocator::Normalized(row_id);
        entry.version += 1;
        Ok(true)
    }
}

/// Blob store keyed by address
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<ContentAddress, u64>>,
    stable_order: bool,
    enumerable: bool,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    /// Create an empty, enumerable, stable-order store
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            stable_order: true,
            enumerable: true,
        }
    }

    /// Report enumeration order as unstable
    #[must_use]
    pub fn with_unstable_order(mut self) -> Self {
        self.stable_order = false;
        self
    }

    /// Report the store as not enumerable
    #[must_use]
    pub fn without_enumeration(mut self) -> Self {
        self.enumerable = false;
        self
    }

    /// Store a blob
    pub fn put(&self, address: impl Into<ContentAddress>, size: u64) {
        self.blobs.lock().insert(address.into(), size);
    }

    /// Delete a blob
    pub fn delete(&self, address: &ContentAddress) -> bool {
        self.blobs.lock().remove(address).is_some()
    }

    /// Number of blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Store holds no blobs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn space_used(&self) -> Result<Option<u64>, StoreError> {
        Ok(Some(self.blobs.lock().values().sum()))
    }

    fn supports_enumeration(&self) -> bool {
        self.enumerable
    }

    fn stable_order(&self) -> bool {
        self.stable_order
    }

    fn enumerate(&self, after: Option<ContentAddress>) -> BlobStream<'_> {
        // Snapshot; blobs written mid-pass are picked up by the next pass
        let snapshot: Vec<_> = {
            let blobs = self.blobs.lock();
            blobs
                .iter()
                .filter(|(address, _)| after.as_ref().map_or(true, |after| *address > after))
                .map(|(address, size)| {
                    Ok(BlobEntry {
                        address: address.clone(),
                        size: *size,
                    })
                })
                .collect()
        };
        futures::stream::iter(snapshot).boxed()
    }

    async fn exists(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.blobs.lock().contains_key(address))
    }
}
