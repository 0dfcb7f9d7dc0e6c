//! Persisted migration progress
//!
//! A flat key/value registry plus [`ProgressTracker`], the typed view used by
//! phase drivers. The registry itself is not transactional; all writers are
//! serialized by the migration lock, which is why every mutating tracker
//! method takes a [`LockSession`].

use crate::error::RegistryError;
use crate::lock::LockSession;
use crate::types::{ContentAddress, MigrationPhase, ProgressRecord};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry key of the reconciliation enumeration cursor
pub const LAST_ADDRESS_KEY: &str = "reconciliation.lastAddress";

/// Value stored under a registry key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryValue {
    /// Flag
    Bool(bool),
    /// Id or counter
    Int(i64),
    /// Free text
    Text(String),
}

impl RegistryValue {
    /// Integer payload
    #[inline]
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RegistryValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload
    #[inline]
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RegistryValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RegistryValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Persistent key/value store for migration state
#[async_trait]
pub trait ProgressRegistry: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<RegistryValue>, RegistryError>;

    /// Write a key
    async fn set(&self, key: &str, value: RegistryValue) -> Result<(), RegistryError>;

    /// Drop a key
    async fn remove(&self, key: &str) -> Result<(), RegistryError>;
}

/// Volatile registry for tests and simulation
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: RwLock<BTreeMap<String, RegistryValue>>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, RegistryValue> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl ProgressRegistry for InMemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<RegistryValue>, RegistryError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: RegistryValue) -> Result<(), RegistryError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDocument {
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    entries: BTreeMap<String, RegistryValue>,
}

/// Registry persisted as a JSON document
///
/// Every write replaces the file atomically: the document goes to a temp file
/// in the same directory which is then renamed over the target. File io runs
/// on the blocking pool, one write at a time.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    document: Mutex<RegistryDocument>,
    writer: tokio::sync::Mutex<()>,
}

impl FileRegistry {
    /// Open `path`, starting empty when the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let document = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of every entry
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, RegistryValue> {
        self.document.lock().entries.clone()
    }

    /// Write the current document to disk
    ///
    /// Callers hold `writer`, so snapshots reach the file in order.
    async fn flush(&self) -> Result<(), RegistryError> {
        let bytes = {
            let mut document = self.document.lock();
            document.updated_at = Some(chrono::Utc::now());
            let mut bytes = serde_json::to_vec_pretty(&*document)?;
            bytes.push(b'\n');
            bytes
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| RegistryError::Backend(format!("registry write task failed: {e}")))?
    }

    fn restore(&self, key: &str, previous: Option<RegistryValue>) {
        let mut document = self.document.lock();
        match previous {
            Some(old) => document.entries.insert(key.to_string(), old),
            None => document.entries.remove(key),
        };
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ProgressRegistry for FileRegistry {
    async fn get(&self, key: &str) -> Result<Option<RegistryValue>, RegistryError> {
        Ok(self.document.lock().entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: RegistryValue) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let previous = {
            let mut document = self.document.lock();
            document.entries.insert(key.to_string(), value)
        };
        if let Err(e) = self.flush().await {
            // Keep memory consistent with disk
            self.restore(key, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let previous = {
            let mut document = self.document.lock();
            document.entries.remove(key)
        };
        if previous.is_none() {
            return Ok(());
        }
        if let Err(e) = self.flush().await {
            self.restore(key, previous);
            return Err(e);
        }
        Ok(())
    }
}

/// Typed access to per-phase progress records
#[derive(Clone)]
pub struct ProgressTracker {
    registry: Arc<dyn ProgressRegistry>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker").finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Wrap a registry
    #[inline]
    #[must_use]
    pub fn new(registry: Arc<dyn ProgressRegistry>) -> Self {
        Self { registry }
    }

    /// Underlying registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ProgressRegistry> {
        &self.registry
    }

    /// Load the record for `phase`; missing keys read as an empty record
    pub async fn load(&self, phase: MigrationPhase) -> Result<ProgressRecord, RegistryError> {
        let max_id = self.get_i64(&phase.max_id_key()).await?;
        let cursor = self.get_i64(&phase.cursor_key()).await?;
        let done = self.get_bool(&phase.done_key()).await?.unwrap_or(false);
        Ok(ProgressRecord {
            phase,
            max_id,
            cursor,
            done,
        })
    }

    /// Load every phase's record in execution order
    pub async fn load_all(&self) -> Result<Vec<ProgressRecord>, RegistryError> {
        let mut records = Vec::with_capacity(MigrationPhase::ALL.len());
        for phase in MigrationPhase::ALL {
            records.push(self.load(phase).await?);
        }
        Ok(records)
    }

    /// Pin the migrated id space of `phase`
    pub async fn record_max_id(
        &self,
        _session: &LockSession,
        phase: MigrationPhase,
        max_id: i64,
    ) -> Result<(), RegistryError> {
        self.registry
            .set(&phase.max_id_key(), RegistryValue::Int(max_id))
            .await
    }

    /// Move the cursor of `phase` forward; moving it backwards is rejected
    pub async fn advance_cursor(
        &self,
        _session: &LockSession,
        phase: MigrationPhase,
        cursor: i64,
    ) -> Result<(), RegistryError> {
        if let Some(current) = self.get_i64(&phase.cursor_key()).await? {
            if cursor < current {
                return Err(RegistryError::CursorRegression {
                    phase,
                    current,
                    proposed: cursor,
                });
            }
        }
        self.registry
            .set(&phase.cursor_key(), RegistryValue::Int(cursor))
            .await
    }

    /// Flag `phase` as finished
    pub async fn mark_done(
        &self,
        _session: &LockSession,
        phase: MigrationPhase,
    ) -> Result<(), RegistryError> {
        self.registry
            .set(&phase.done_key(), RegistryValue::Bool(true))
            .await
    }

    /// Address after which reconciliation resumes
    pub async fn last_address(&self) -> Result<Option<ContentAddress>, RegistryError> {
        match self.registry.get(LAST_ADDRESS_KEY).await? {
            None => Ok(None),
            Some(RegistryValue::Text(address)) => Ok(Some(ContentAddress::new(address))),
            Some(_) => Err(RegistryError::TypeMismatch {
                key: LAST_ADDRESS_KEY.to_string(),
                expected: "text",
            }),
        }
    }

    /// Record (or clear) the reconciliation resumption point
    pub async fn record_last_address(
        &self,
        _session: &LockSession,
        address: Option<&ContentAddress>,
    ) -> Result<(), RegistryError> {
        match address {
            Some(address) => {
                self.registry
                    .set(LAST_ADDRESS_KEY, RegistryValue::Text(address.to_string()))
                    .await
            }
            None => self.registry.remove(LAST_ADDRESS_KEY).await,
        }
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, RegistryError> {
        match self.registry.get(key).await? {
            None => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or(RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: "an integer",
            }),
        }
    }

    async fn get_bool(&self, key: &str) -> Result<Option<bool>, RegistryError> {
        match self.registry.get(key).await? {
            None => Ok(None),
            Some(value) => value.as_bool().map(Some).ok_or(RegistryError::TypeMismatch {
                key: key.to_string(),
                expected: "a boolean",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_get_set_remove() {
        let registry = InMemoryRegistry::new();
        assert_eq!(registry.get("a").await.unwrap(), None);

        registry.set("a", RegistryValue::Int(7)).await.unwrap();
        assert_eq!(registry.get("a").await.unwrap(), Some(RegistryValue::Int(7)));

        registry.remove("a").await.unwrap();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn values_serialize_untagged() {
        let json = serde_json::to_string(&RegistryValue::Bool(true)).unwrap();
        assert_eq!(json, "true");
        let value: RegistryValue = serde_json::from_str("42").unwrap();
        assert_eq!(value, RegistryValue::Int(42));
        let value: RegistryValue = serde_json::from_str("\"blob://1\"").unwrap();
        assert_eq!(value.as_text(), Some("blob://1"));
    }

    #[tokio::test]
    async fn tracker_reports_type_mismatch() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .set("tree.cursor", RegistryValue::Text("oops".into()))
            .await
            .unwrap();

        let tracker = ProgressTracker::new(registry);
        let err = tracker.load(MigrationPhase::Tree).await.unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn empty_registry_loads_fresh_records() {
        let tracker = ProgressTracker::new(Arc::new(InMemoryRegistry::new()));
        let records = tracker.load_all().await.unwrap();

        assert_eq!(records.len(), 3);
        for (record, phase) in records.iter().zip(MigrationPhase::ALL) {
            assert_eq!(record, &ProgressRecord::new(phase));
        }
        assert_eq!(tracker.last_address().await.unwrap(), None);
    }
}
