//! Error types for CAM Core
//!
//! Provides error handling for:
//! - Cluster lock acquisition and heartbeat failures
//! - Progress registry persistence
//! - Configuration loading

use crate::types::MigrationPhase;

/// Cluster lock errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Heartbeat failed: the lock expired or was taken over
    #[error("lock `{resource}` was lost (expired or taken over)")]
    Lost { resource: String },

    /// Lock service itself failed
    #[error("lock service failure: {0}")]
    Backend(String),
}

impl LockError {
    /// Lost locks must never be followed by further writes
    #[inline]
    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost { .. })
    }
}

/// Progress registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Backing file could not be read or written
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing document is not valid JSON
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value has the wrong type for the key
    #[error("registry key `{key}` holds a value that is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// Attempt to move a cursor backwards
    #[error("cursor for {phase} would regress from {current} to {proposed}")]
    CursorRegression {
        phase: MigrationPhase,
        current: i64,
        proposed: i64,
    },

    /// Registry backend failure
    #[error("registry backend failure: {0}")]
    Backend(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}
