use async_trait::async_trait;

use crate::error::{ApplyError, LogError, StorageError};
use crate::message::{Entry, LogEntry};

pub type LogResult<T> = Result<T, LogError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Metadata key holding the highest index known to be replicated to a quorum.
pub const COMMIT_INDEX_KEY: &str = "commit_index";
/// Metadata key holding the highest index applied to the state machine.
pub const LAST_APPLIED_KEY: &str = "last_applied";

/// Durable, ordered storage of log entries.
///
/// Indices start at 1 and are gap-free. Implementations must make every
/// mutation atomic: a failed call leaves no partial state visible to readers.
///
/// - `append_entry`: assign `last_log_index + 1` and persist the entry.
/// - `append_entries`: persist entries carrying their own indices, all or nothing.
///   The first index must be `last_log_index + 1`.
/// - `get_log_entries`: entries in `[low, high)`, clamped to the stored range.
/// - `get_last_log_index`: `(index, term)` of the last entry, `(0, 0)` when empty.
/// - `truncate_log_suffix`: drop every entry with an index greater than `idx`.
#[async_trait]
pub trait LogEntryStorage: Send + Sync {
    async fn append_entry(&self, term: u64, command: String) -> StorageResult<u64>;

    async fn append_entries(&self, entries: &[LogEntry]) -> StorageResult<()>;

    async fn get_log_entry(&self, idx: u64) -> StorageResult<Option<LogEntry>>;

    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>>;

    async fn get_log_term(&self, idx: u64) -> StorageResult<Option<u64>>;

    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)>;

    async fn has_log_entry(&self, idx: u64) -> StorageResult<bool>;

    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// Durable key to integer mapping. Unset keys read as `0`.
#[async_trait]
pub trait MetaStorage: Send + Sync {
    async fn get_meta(&self, key: &str) -> StorageResult<u64>;

    async fn set_meta(&self, key: &str, value: u64) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// Receiver of committed commands.
///
/// Called once per entry, in index order. Returning an error halts the
/// current apply batch; the same entry is offered again on the next call.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply_command(&self, entry: &Entry) -> ApplyResult<()>;
}
