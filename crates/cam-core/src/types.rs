//! Core types for content address migration
//!
//! Defines the fundamental types shared by every phase:
//! - Migration phases and their registry keys
//! - Persisted progress records
//! - Id ranges handed to workers
//! - Content addresses and lock handles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A phase of the migration, each with its own progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Bulk rewrite of rows in the relational node store
    Relational,
    /// Per-entry rewrite of the versioned tree store
    Tree,
    /// Orphan detection over the physical blob store
    Reconciliation,
}

impl MigrationPhase {
    /// All phases in execution order
    pub const ALL: [MigrationPhase; 3] = [
        MigrationPhase::Relational,
        MigrationPhase::Tree,
        MigrationPhase::Reconciliation,
    ];

    /// Prefix used for this phase's registry keys
    #[inline]
    #[must_use]
    pub fn key_prefix(&self) -> &'static str {
        match self {
            MigrationPhase::Relational => "relational",
            MigrationPhase::Tree => "tree",
            MigrationPhase::Reconciliation => "reconciliation",
        }
    }

    /// Registry key holding the inclusive max id captured at migration start
    #[must_use]
    pub fn max_id_key(&self) -> String {
        format!("{}.maxId", self.key_prefix())
    }

    /// Registry key holding the next id to process
    #[must_use]
    pub fn cursor_key(&self) -> String {
        format!("{}.cursor", self.key_prefix())
    }

    /// Registry key holding the done flag
    #[must_use]
    pub fn done_key(&self) -> String {
        format!("{}.done", self.key_prefix())
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Relational => write!(f, "relational store"),
            MigrationPhase::Tree => write!(f, "tree store"),
            MigrationPhase::Reconciliation => write!(f, "reconciliation"),
        }
    }
}

/// Persisted progress of one phase
///
/// `max_id` is the inclusive maximum id that existed when the phase first
/// ran. Entities created later are already written in the normalized format
/// and fall outside the migrated id space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Owning phase
    pub phase: MigrationPhase,
    /// Inclusive max id captured once at first run
    pub max_id: Option<i64>,
    /// Next id to process
    pub cursor: Option<i64>,
    /// Phase finished
    pub done: bool,
}

impl ProgressRecord {
    /// Empty record for a phase that has never run
    #[inline]
    #[must_use]
    pub fn new(phase: MigrationPhase) -> Self {
        Self {
            phase,
            max_id: None,
            cursor: None,
            done: false,
        }
    }

    /// Exclusive upper bound of the migrated id space
    #[inline]
    #[must_use]
    pub fn high_water_mark(&self) -> Option<i64> {
        self.max_id.map(|max| max.saturating_add(1))
    }

    /// Ids left between the cursor and the high-water mark
    #[must_use]
    pub fn remaining(&self) -> Option<i64> {
        match (self.cursor, self.high_water_mark()) {
            (Some(cursor), Some(hwm)) => Some((hwm - cursor).max(0)),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.done {
            return write!(f, "{}: done", self.phase);
        }
        match (self.cursor, self.high_water_mark()) {
            (Some(cursor), Some(hwm)) => write!(f, "{}: at {} of {}", self.phase, cursor, hwm),
            (None, Some(hwm)) => write!(f, "{}: pending (0 of {})", self.phase, hwm),
            _ => write!(f, "{}: not started", self.phase),
        }
    }
}

/// Half-open id range `[start, end)` processed by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdRange {
    /// First id, inclusive
    pub start: i64,
    /// Last id, exclusive
    pub end: i64,
}

impl IdRange {
    /// Create a range; `end` is clamped so it never precedes `start`
    #[inline]
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Number of ids covered
    #[inline]
    #[must_use]
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// Range covers no ids
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Check if `id` falls inside the range
    #[inline]
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        id >= self.start && id < self.end
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Opaque locator of a physical content blob
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Wrap an address string
    #[inline]
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the raw address
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Proof of holding the cluster-wide migration lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    /// Opaque token issued by the coordinator
    pub token: String,
    /// Name of the locked resource
    pub resource: String,
    /// When the lock was first acquired
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// How the sequencer was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    /// One bounded batch per phase, re-invoked by an external scheduler
    ScheduledTick,
    /// Drive every phase to completion in this call
    OneShot,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationMode::ScheduledTick => write!(f, "scheduled-tick"),
            InvocationMode::OneShot => write!(f, "one-shot"),
        }
    }
}

impl FromStr for InvocationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tick" | "scheduled-tick" | "scheduled" => Ok(InvocationMode::ScheduledTick),
            "one-shot" | "oneshot" | "once" => Ok(InvocationMode::OneShot),
            other => Err(format!("unknown invocation mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_keys_are_stable() {
        assert_eq!(MigrationPhase::Relational.max_id_key(), "relational.maxId");
        assert_eq!(MigrationPhase::Tree.cursor_key(), "tree.cursor");
        assert_eq!(MigrationPhase::Reconciliation.done_key(), "reconciliation.done");
    }

    #[test]
    fn high_water_mark_is_exclusive() {
        let mut record = ProgressRecord::new(MigrationPhase::Relational);
        assert_eq!(record.high_water_mark(), None);

        record.max_id = Some(249);
        record.cursor = Some(200);
        assert_eq!(record.high_water_mark(), Some(250));
        assert_eq!(record.remaining(), Some(50));
    }

    #[test]
    fn id_range_never_inverts() {
        let range = IdRange::new(10, 5);
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);

        let range = IdRange::new(0, 100);
        assert!(range.contains(0));
        assert!(range.contains(99));
        assert!(!range.contains(100));
        assert_eq!(range.to_string(), "[0, 100)");
    }

    #[test]
    fn invocation_mode_parses_aliases() {
        assert_eq!("tick".parse::<InvocationMode>(), Ok(InvocationMode::ScheduledTick));
        assert_eq!("ONE-SHOT".parse::<InvocationMode>(), Ok(InvocationMode::OneShot));
        assert!("sometimes".parse::<InvocationMode>().is_err());
    }

    #[test]
    fn record_display() {
        let mut record = ProgressRecord::new(MigrationPhase::Tree);
        assert_eq!(record.to_string(), "tree store: not started");

        record.max_id = Some(99);
        record.cursor = Some(40);
        assert_eq!(record.to_string(), "tree store: at 40 of 100");

        record.done = true;
        assert_eq!(record.to_string(), "tree store: done");
    }
}
