use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Top-level error returned by [`crate::RaftLog`].
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Apply of entry {index} failed: {source}")]
    Apply {
        index: u64,
        #[source]
        source: ApplyError,
    },
}

/// Malformed input, rejected before anything touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid log index {0}")]
    InvalidIndex(u64),

    #[error("Entries are not contiguous (expected index {expected}, found {found})")]
    NonContiguous { expected: u64, found: u64 },

    #[error("Cannot truncate after {index}: entries up to {commit_index} are committed")]
    TruncateCommitted { index: u64, commit_index: u64 },

    #[error("Commit index {index} is beyond the last log index {last_log_index}")]
    CommitBeyondLog { index: u64, last_log_index: u64 },
}

/// Failures of the durable backing store.
///
/// Cloneable so that one result of a group-committed write can be handed to
/// every request in the group.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),

    #[error("Corrupted data at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("Log index conflict (expected index {expected}, found {found})")]
    IndexConflict { expected: u64, found: u64 },

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Storage is closed")]
    Closed,

    #[error("Storage writer channel closed")]
    ChannelClosed,

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl From<anyhow::Error> for StorageError {
    fn from(e: anyhow::Error) -> Self {
        StorageError::Io(Arc::new(e))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(Arc::new(e.into()))
    }
}

/// Errors raised by a [`crate::traits::StateMachine`] while applying a command.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("Command at index {index} rejected: {reason}")]
    Rejected { index: u64, reason: String },

    #[error("State machine error: {0}")]
    Internal(String),
}

/// Errors loading [`crate::RaftLogOptions`] from a file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
