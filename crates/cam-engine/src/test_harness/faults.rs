//! Fault-injecting store wrappers
//!
//! Each wrapper delegates to an inner store and injects one kind of failure,
//! either scripted (fail this range once) or drawn from a seeded RNG.

use crate::error::StoreError;
use crate::memory::MemoryTreeStore;
use crate::store::{BlobStore, BlobStream, RelationalStore, TreeStore};
use async_trait::async_trait;
use cam_core::{ContentAddress, IdRange, ShutdownSignal};
use futures::StreamExt;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a scripted range failure behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fail before touching any row
    BeforeWrite,
    /// Apply the update, then report failure
    AfterWrite,
}

/// Relational store that fails selected ranges
pub struct FlakyRelationalStore {
    inner: Arc<dyn RelationalStore>,
    scripted: Mutex<HashMap<i64, FailureMode>>,
    random: Option<Mutex<(StdRng, f64)>>,
    submitted: Mutex<Vec<IdRange>>,
}

impl FlakyRelationalStore {
    /// Wrap `inner` with no failures scheduled
    #[must_use]
    pub fn new(inner: Arc<dyn RelationalStore>) -> Self {
        Self {
            inner,
            scripted: Mutex::new(HashMap::new()),
            random: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Fail each range with probability `rate`
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64, seed: u64) -> Self {
        self.random = Some(Mutex::new((StdRng::seed_from_u64(seed), rate.clamp(0.0, 1.0))));
        self
    }

    /// Fail the next update of the range starting at `start`
    pub fn fail_once(&self, start: i64, mode: FailureMode) {
        self.scripted.lock().insert(start, mode);
    }

    /// Every range submitted so far, in submission order
    #[must_use]
    pub fn submitted(&self) -> Vec<IdRange> {
        self.submitted.lock().clone()
    }

    fn failure_for(&self, range: IdRange) -> Option<FailureMode> {
        if let Some(mode) = self.scripted.lock().remove(&range.start) {
            return Some(mode);
        }
        let random = self.random.as_ref()?;
        let mut guard = random.lock();
        let (rng, rate) = &mut *guard;
        rng.gen_bool(*rate).then_some(FailureMode::BeforeWrite)
    }
}

#[async_trait]
impl RelationalStore for FlakyRelationalStore {
    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.inner.max_id().await
    }

    async fn update_range(&self, range: IdRange) -> Result<u64, StoreError> {
        self.submitted.lock().push(range);
        match self.failure_for(range) {
            None => self.inner.update_range(range).await,
            Some(FailureMode::BeforeWrite) => Err(StoreError::Unavailable(format!(
                "injected failure for {range}"
            ))),
            Some(FailureMode::AfterWrite) => {
                self.inner.update_range(range).await?;
                Err(StoreError::Backend(format!(
                    "injected failure after writing {range}"
                )))
            }
        }
    }
}

/// Tree store whose entries are concurrently modified during rewrite
pub struct ConflictingTreeStore {
    inner: Arc<MemoryTreeStore>,
    conflicts_per_entry: u32,
    attempts: Mutex<HashMap<i64, u32>>,
    random: Option<Mutex<(StdRng, f64)>>,
}

impl ConflictingTreeStore {
    /// Conflict on the first `conflicts_per_entry` rewrites of every entry
    #[must_use]
    pub fn new(inner: Arc<MemoryTreeStore>, conflicts_per_entry: u32) -> Self {
        Self {
            inner,
            conflicts_per_entry,
            attempts: Mutex::new(HashMap::new()),
            random: None,
        }
    }

    /// Conflict on each rewrite with probability `rate` instead
    #[must_use]
    pub fn with_conflict_rate(mut self, rate: f64, seed: u64) -> Self {
        self.random = Some(Mutex::new((StdRng::seed_from_u64(seed), rate.clamp(0.0, 1.0))));
        self
    }

    /// Rewrite attempts seen for entry `id`
    #[must_use]
    pub fn attempts(&self, id: i64) -> u32 {
        self.attempts.lock().get(&id).copied().unwrap_or(0)
    }

    fn should_conflict(&self, id: i64) -> bool {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        match &self.random {
            Some(random) => {
                let mut guard = random.lock();
                let (rng, rate) = &mut *guard;
                rng.gen_bool(*rate)
            }
            None => attempt <= self.conflicts_per_entry,
        }
    }
}

#[async_trait]
impl TreeStore for ConflictingTreeStore {
    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.inner.max_id().await
    }

    async fn find_ids_needing_migration(&self, range: IdRange) -> Result<Vec<i64>, StoreError> {
        self.inner.find_ids_needing_migration(range).await
    }

    async fn rewrite_entry(&self, id: i64) -> Result<bool, StoreError> {
        if self.should_conflict(id) {
            self.inner.touch(id);
            return Err(StoreError::Conflict { id });
        }
        self.inner.rewrite_entry(id).await
    }
}

/// Blob store that requests shutdown after a number of enumerated entries
pub struct InterruptingBlobStore {
    inner: Arc<dyn BlobStore>,
    shutdown: ShutdownSignal,
    after: usize,
    seen: Arc<AtomicUsize>,
}

impl InterruptingBlobStore {
    /// Request `shutdown` once `after` entries were yielded
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStore>, shutdown: ShutdownSignal, after: usize) -> Self {
        Self {
            inner,
            shutdown,
            after,
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Entries yielded across all enumerations
    #[must_use]
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for InterruptingBlobStore {
    async fn space_used(&self) -> Result<Option<u64>, StoreError> {
        self.inner.space_used().await
    }

    fn supports_enumeration(&self) -> bool {
        self.inner.supports_enumeration()
    }

    fn stable_order(&self) -> bool {
        self.inner.stable_order()
    }

    fn enumerate(&self, after: Option<ContentAddress>) -> BlobStream<'_> {
        let seen = Arc::clone(&self.seen);
        let shutdown = self.shutdown.clone();
        let threshold = self.after;
        self.inner
            .enumerate(after)
            .inspect(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) + 1 == threshold {
                    shutdown.request();
                }
            })
            .boxed()
    }

    async fn exists(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        self.inner.exists(address).await
    }
}

/// Blob store that drops an address between enumeration and the exists check
pub struct VanishingBlobStore {
    inner: Arc<dyn BlobStore>,
    vanished: HashSet<ContentAddress>,
}

impl VanishingBlobStore {
    /// Report `vanished` as enumerated but no longer existing
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStore>, vanished: impl IntoIterator<Item = ContentAddress>) -> Self {
        Self {
            inner,
            vanished: vanished.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BlobStore for VanishingBlobStore {
    async fn space_used(&self) -> Result<Option<u64>, StoreError> {
        self.inner.space_used().await
    }

    fn supports_enumeration(&self) -> bool {
        self.inner.supports_enumeration()
    }

    fn stable_order(&self) -> bool {
        self.inner.stable_order()
    }

    fn enumerate(&self, after: Option<ContentAddress>) -> BlobStream<'_> {
        self.inner.enumerate(after)
    }

    async fn exists(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        if self.vanished.contains(address) {
            return Ok(false);
        }
        self.inner.exists(address).await
    }
}

/// Blob store whose existence checks take a fixed time
///
/// Stretches a reconciliation pass so lock expiry between checkpoints shows up
/// under a paused tokio clock.
pub struct SlowBlobStore {
    inner: Arc<dyn BlobStore>,
    latency: Duration,
}

impl SlowBlobStore {
    /// Delay every `exists` call by `latency`
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStore>, latency: Duration) -> Self {
        Self { inner, latency }
    }
}

#[async_trait]
impl BlobStore for SlowBlobStore {
    async fn space_used(&self) -> Result<Option<u64>, StoreError> {
        self.inner.space_used().await
    }

    fn supports_enumeration(&self) -> bool {
        self.inner.supports_enumeration()
    }

    fn stable_order(&self) -> bool {
        self.inner.stable_order()
    }

    fn enumerate(&self, after: Option<ContentAddress>) -> BlobStream<'_> {
        self.inner.enumerate(after)
    }

    async fn exists(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.exists(address).await
    }
}
