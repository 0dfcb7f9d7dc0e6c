//! Range batch driver
//!
//! Drives one id-space phase forward by one batch per call:
//!
//! 1. Load the high-water mark (capturing it on first run) and the cursor
//! 2. Split the next stretch of ids into contiguous ranges
//! 3. Run the ranges on a bounded worker pool, one unit of work each
//! 4. Advance the cursor only when every range succeeded
//!
//! Units of work are idempotent, so a failed batch is simply re-submitted by
//! the next invocation, including ranges that had already succeeded.

use crate::error::{MigrationError, RangeFailure, StoreError};
use async_trait::async_trait;
use cam_core::{
    ConfigError, IdRange, LockSession, MigrationConfig, MigrationPhase, ProgressTracker,
};
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// Idempotent unit of work over an id range of one store
#[async_trait]
pub trait RangeWork: Send + Sync + 'static {
    /// Phase this work belongs to
    fn phase(&self) -> MigrationPhase;

    /// Lowest id the store can hold
    fn first_id(&self) -> i64 {
        0
    }

    /// Current max id of the store, `None` when empty
    async fn max_id(&self) -> Result<Option<i64>, StoreError>;

    /// Migrate every entity in `range`; returns the number rewritten
    async fn process_range(&self, range: IdRange) -> Result<u64, StoreError>;
}

/// Split `[cursor, high_water_mark)` into at most `count` ranges of `width`
///
/// Ranges are contiguous and ascending; the last one is clamped to the
/// high-water mark.
#[must_use]
pub fn plan_ranges(cursor: i64, high_water_mark: i64, width: u32, count: usize) -> Vec<IdRange> {
    let width = i64::from(width.max(1));
    let mut ranges = Vec::with_capacity(count);
    let mut start = cursor;
    while ranges.len() < count && start < high_water_mark {
        let end = start.saturating_add(width).min(high_water_mark);
        ranges.push(IdRange::new(start, end));
        start = end;
    }
    ranges
}

/// Result of one driver invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Driven phase
    pub phase: MigrationPhase,
    /// Ranges executed in this invocation
    pub ranges: usize,
    /// Entities rewritten in this invocation
    pub rewritten: u64,
    /// Cursor after the invocation
    pub cursor: i64,
    /// Exclusive upper bound of the migrated id space
    pub high_water_mark: i64,
    /// Phase finished
    pub done: bool,
}

/// Sizing of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizing {
    /// Range width
    pub batch_size: u32,
    /// Worker pool size
    pub thread_count: usize,
    /// Ranges queued per worker
    pub ranges_per_thread: usize,
}

impl From<&MigrationConfig> for BatchSizing {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            thread_count: config.thread_count,
            ranges_per_thread: config.ranges_per_thread,
        }
    }
}

/// Drives a [`RangeWork`] phase across invocations
pub struct RangeBatchDriver<W> {
    work: Arc<W>,
    tracker: ProgressTracker,
    sizing: BatchSizing,
}

impl<W: RangeWork> RangeBatchDriver<W> {
    /// Create a driver
    #[must_use]
    pub fn new(work: W, tracker: ProgressTracker, sizing: BatchSizing) -> Self {
        Self {
            work: Arc::new(work),
            tracker,
            sizing,
        }
    }

    /// Underlying unit of work
    #[inline]
    #[must_use]
    pub fn work(&self) -> &W {
        &self.work
    }

    /// Progress tracker
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Run one batch
    ///
    /// # Errors
    /// - `MigrationError::Lock` if the lock heartbeat fails before or after
    ///   the batch; no progress is persisted in that case
    /// - `MigrationError::RangeWorkers` if any range failed; the cursor stays
    ///   where it was
    /// - `MigrationError::Config` if the sizing plans no ranges while ids
    ///   remain
    pub async fn run_batch(&self, session: &LockSession) -> Result<BatchOutcome, MigrationError> {
        let phase = self.work.phase();
        session.refresh().await?;

        let record = self.tracker.load(phase).await?;
        let max_id = match record.max_id {
            Some(max_id) => max_id,
            None => {
                let max_id = self
                    .work
                    .max_id()
                    .await?
                    .unwrap_or(self.work.first_id() - 1);
                self.tracker.record_max_id(session, phase, max_id).await?;
                tracing::info!(%phase, max_id, "captured migration high-water mark");
                max_id
            }
        };
        let high_water_mark = max_id.saturating_add(1);
        let cursor = record.cursor.unwrap_or_else(|| self.work.first_id());

        let mut outcome = BatchOutcome {
            phase,
            ranges: 0,
            rewritten: 0,
            cursor,
            high_water_mark,
            done: record.done,
        };
        if record.done {
            return Ok(outcome);
        }
        if cursor >= high_water_mark {
            self.tracker.mark_done(session, phase).await?;
            tracing::info!(%phase, cursor, high_water_mark, "nothing left to migrate");
            outcome.done = true;
            return Ok(outcome);
        }

        let ranges = plan_ranges(
            cursor,
            high_water_mark,
            self.sizing.batch_size,
            self.sizing.thread_count * self.sizing.ranges_per_thread,
        );
        let Some(last) = ranges.last().copied() else {
            return Err(ConfigError::Invalid(format!(
                "{phase}: batch sizing {:?} plans no ranges with ids {cursor}..{high_water_mark} left",
                self.sizing
            ))
            .into());
        };
        tracing::debug!(%phase, count = ranges.len(), first = %ranges[0], %last, "submitting ranges");

        let submitted = ranges.len();
        let (rewritten, failures) = self.execute(ranges).await;
        if !failures.is_empty() {
            tracing::error!(%phase, failed = failures.len(), submitted, cursor, "batch failed; cursor not advanced");
            return Err(MigrationError::RangeWorkers {
                phase,
                submitted,
                failed: failures.len(),
                failures,
            });
        }

        // Nothing is persisted unless we still hold the lock
        session.refresh().await?;
        self.tracker.advance_cursor(session, phase, last.end).await?;
        outcome.ranges = submitted;
        outcome.rewritten = rewritten;
        outcome.cursor = last.end;

        if last.end >= high_water_mark {
            self.tracker.mark_done(session, phase).await?;
            outcome.done = true;
            tracing::info!(%phase, cursor = last.end, high_water_mark, "phase complete");
        } else {
            tracing::info!(%phase, cursor = last.end, high_water_mark, rewritten, "batch complete");
        }
        Ok(outcome)
    }

    /// Run `ranges` on at most `thread_count` concurrent workers
    async fn execute(&self, ranges: Vec<IdRange>) -> (u64, Vec<RangeFailure>) {
        let phase = self.work.phase();
        let workers = self.sizing.thread_count.max(1);

        let results: Vec<(IdRange, Result<u64, String>)> = futures::stream::iter(ranges)
            .map(|range| {
                let work = Arc::clone(&self.work);
                async move {
                    let span = tracing::debug_span!("range", %phase, start = range.start, end = range.end);
                    let task = tokio::spawn(
                        async move {
                            AssertUnwindSafe(work.process_range(range))
                                .catch_unwind()
                                .await
                        }
                        .instrument(span),
                    );
                    let result = match task.await {
                        Ok(Ok(Ok(rewritten))) => Ok(rewritten),
                        Ok(Ok(Err(e))) => Err(e.to_string()),
                        Ok(Err(_panic)) => Err("worker panicked".to_string()),
                        Err(e) => Err(format!("worker task failed: {e}")),
                    };
                    (range, result)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut rewritten = 0;
        let mut failures = Vec::new();
        for (range, result) in results {
            match result {
                Ok(count) => rewritten += count,
                Err(error) => {
                    tracing::warn!(%phase, %range, %error, "range failed");
                    failures.push(RangeFailure { range, error });
                }
            }
        }
        failures.sort_by_key(|f| f.range);
        (rewritten, failures)
    }
}
