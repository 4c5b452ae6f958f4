//! The replicated log of one Raft node.
//!
//! [`RaftLog`] owns the log and metadata stores and the state machine hook.
//! The consensus core decides what gets appended, when entries become
//! committed, and where a diverged suffix has to be cut; this type keeps the
//! data durable and applies committed commands exactly once, in order.

use std::fmt::{self, Display};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RaftLogOptions;
use crate::error::{LogError, StorageError, ValidationError};
use crate::message::{Entry, EntryInfo, LogEntry};
use crate::storage::{FileLogStore, FileMetaStore};
use crate::traits::{
    COMMIT_INDEX_KEY, LAST_APPLIED_KEY, LogEntryStorage, LogResult, MetaStorage, StateMachine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    Applying,
}

impl Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplyState::Idle => write!(f, "Idle"),
            ApplyState::Applying => write!(f, "Applying"),
        }
    }
}

/// Marks the engine as applying for as long as it lives.
struct ApplyingGuard<'a>(&'a Mutex<ApplyState>);

impl<'a> ApplyingGuard<'a> {
    fn enter(state: &'a Mutex<ApplyState>) -> Self {
        *state.lock() = ApplyState::Applying;
        Self(state)
    }
}

impl Drop for ApplyingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = ApplyState::Idle;
    }
}

pub struct RaftLog {
    log: Arc<dyn LogEntryStorage>,
    meta: Arc<dyn MetaStorage>,
    state_machine: Arc<dyn StateMachine>,
    apply_batch_size: usize,
    // Serializes commit index updates so that concurrent callers cannot regress it.
    commit_lock: tokio::sync::Mutex<()>,
    // Only one apply loop runs at a time.
    apply_lock: tokio::sync::Mutex<()>,
    apply_state: Mutex<ApplyState>,
}

impl RaftLog {
    /// Open the file-backed log and metadata under `options.base_dir`.
    ///
    /// Must be called from within a Tokio runtime: the log store's writer
    /// task is spawned here.
    pub fn open(options: RaftLogOptions, state_machine: Arc<dyn StateMachine>) -> LogResult<Self> {
        std::fs::create_dir_all(&options.base_dir).map_err(StorageError::from)?;

        let (log_store, rx) = FileLogStore::new(options.log_store_options())?;
        log_store.start(rx);
        let meta_store = FileMetaStore::open(options.meta_store_options())?;

        info!("Opened raft log in {:?}", options.base_dir);
        Ok(Self::with_storage(
            Arc::new(log_store),
            Arc::new(meta_store),
            state_machine,
            options.apply_batch_size,
        ))
    }

    /// Build a log on top of already opened stores.
    pub fn with_storage(
        log: Arc<dyn LogEntryStorage>,
        meta: Arc<dyn MetaStorage>,
        state_machine: Arc<dyn StateMachine>,
        apply_batch_size: usize,
    ) -> Self {
        Self {
            log,
            meta,
            state_machine,
            apply_batch_size: apply_batch_size.max(1),
            commit_lock: tokio::sync::Mutex::new(()),
            apply_lock: tokio::sync::Mutex::new(()),
            apply_state: Mutex::new(ApplyState::Idle),
        }
    }

    // === Log store ===

    /// Append a command at the next free index and return that index.
    pub async fn append_entry(&self, term: u64, command: impl Into<String>) -> LogResult<u64> {
        let index = self.log.append_entry(term, command.into()).await?;
        debug!("Appended entry {} (term {})", index, term);
        Ok(index)
    }

    /// Append entries replicated from a leader, keeping their indices.
    ///
    /// The entries must be contiguous and continue the log; either all of
    /// them are stored or none is.
    pub async fn append_entries(&self, entries: &[LogEntry]) -> LogResult<()> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        if first.index == 0 {
            return Err(ValidationError::InvalidIndex(0).into());
        }
        for (pos, entry) in entries.iter().enumerate() {
            let expected = first
                .index
                .checked_add(pos as u64)
                .ok_or(ValidationError::InvalidIndex(entry.index))?;
            if entry.index != expected {
                return Err(ValidationError::NonContiguous {
                    expected,
                    found: entry.index,
                }
                .into());
            }
        }

        self.log.append_entries(entries).await?;
        debug!("Appended entries [{}, {}]", first.index, last.index);
        Ok(())
    }

    pub async fn get_entry(&self, index: u64) -> LogResult<Option<Entry>> {
        let Some(entry) = self.log.get_log_entry(index).await? else {
            return Ok(None);
        };
        let commit_index = self.get_commit_index().await?;
        Ok(Some(Entry::from_log_entry(entry, commit_index)))
    }

    /// Entries in `[from_index, to_index)`, in index order.
    pub async fn get_entries(&self, from_index: u64, to_index: u64) -> LogResult<Vec<Entry>> {
        let entries = self.log.get_log_entries(from_index, to_index).await?;
        let commit_index = self.get_commit_index().await?;
        Ok(entries
            .into_iter()
            .map(|e| Entry::from_log_entry(e, commit_index))
            .collect())
    }

    pub async fn get_last_entry(&self) -> LogResult<Option<Entry>> {
        let last = self.get_last_log_index().await?;
        if last == 0 {
            return Ok(None);
        }
        self.get_entry(last).await
    }

    pub async fn get_last_log_index(&self) -> LogResult<u64> {
        Ok(self.log.get_last_log_index().await?.0)
    }

    pub async fn get_last_log_term(&self) -> LogResult<u64> {
        Ok(self.log.get_last_log_index().await?.1)
    }

    pub async fn get_prev_log_index(&self) -> LogResult<u64> {
        Ok(self.get_last_log_index().await?.saturating_sub(1))
    }

    pub async fn get_prev_log_term(&self) -> LogResult<u64> {
        let prev = self.get_prev_log_index().await?;
        if prev == 0 {
            return Ok(0);
        }
        Ok(self.log.get_log_term(prev).await?.unwrap_or(0))
    }

    /// Drop every entry after `index`. Committed entries are never dropped.
    pub async fn remove_entries_after(&self, index: u64) -> LogResult<()> {
        let commit_index = self.get_commit_index().await?;
        if index < commit_index {
            warn!(
                "Refusing to truncate after {}: commit index is {}",
                index, commit_index
            );
            return Err(ValidationError::TruncateCommitted {
                index,
                commit_index,
            }
            .into());
        }
        self.log.truncate_log_suffix(index).await?;
        Ok(())
    }

    pub async fn has(&self, index: u64) -> LogResult<bool> {
        Ok(self.log.has_log_entry(index).await?)
    }

    // === Commit & apply ===

    pub async fn get_commit_index(&self) -> LogResult<u64> {
        Ok(self.meta.get_meta(COMMIT_INDEX_KEY).await?)
    }

    pub async fn get_last_applied(&self) -> LogResult<u64> {
        Ok(self.meta.get_meta(LAST_APPLIED_KEY).await?)
    }

    /// Advance the commit index and return its value afterwards.
    ///
    /// A value below the current commit index leaves it unchanged. A value
    /// beyond the last log index is rejected.
    pub async fn set_commit_index(&self, index: u64) -> LogResult<u64> {
        let _guard = self.commit_lock.lock().await;

        let current = self.get_commit_index().await?;
        if index <= current {
            if index < current {
                debug!(
                    "Ignoring commit index {} below current {}",
                    index, current
                );
            }
            return Ok(current);
        }

        let last_log_index = self.get_last_log_index().await?;
        if index > last_log_index {
            return Err(ValidationError::CommitBeyondLog {
                index,
                last_log_index,
            }
            .into());
        }

        self.meta.set_meta(COMMIT_INDEX_KEY, index).await?;
        debug!("Commit index advanced {} -> {}", current, index);
        Ok(index)
    }

    pub fn apply_state(&self) -> ApplyState {
        *self.apply_state.lock()
    }

    /// Apply every committed entry that has not been applied yet and return
    /// how many were applied.
    ///
    /// `last_applied` is persisted after each entry, so an interrupted run
    /// resumes right after the last entry that went through. If the state
    /// machine fails, the run stops there and the failed entry is offered
    /// again on the next call.
    pub async fn apply_entries(&self) -> LogResult<u64> {
        let _guard = self.apply_lock.lock().await;
        let _applying = ApplyingGuard::enter(&self.apply_state);

        let commit_index = self.get_commit_index().await?;
        let mut last_applied = self.get_last_applied().await?;
        let mut applied = 0;

        while last_applied < commit_index {
            let high = (last_applied + 1 + self.apply_batch_size as u64).min(commit_index + 1);
            let entries = self.log.get_log_entries(last_applied + 1, high).await?;
            if entries.is_empty() {
                warn!(
                    "Committed entry {} is missing from the log",
                    last_applied + 1
                );
                return Err(StorageError::Consistency(format!(
                    "committed entry {} is missing",
                    last_applied + 1
                ))
                .into());
            }

            for log_entry in entries {
                if log_entry.index != last_applied + 1 {
                    return Err(StorageError::Consistency(format!(
                        "expected entry {} while applying, read {}",
                        last_applied + 1,
                        log_entry.index
                    ))
                    .into());
                }

                let entry = Entry::from_log_entry(log_entry, commit_index);
                if let Err(source) = self.state_machine.apply_command(&entry).await {
                    warn!("Failed to apply entry {}: {}", entry.index, source);
                    return Err(LogError::Apply {
                        index: entry.index,
                        source,
                    });
                }

                self.meta
                    .set_meta(LAST_APPLIED_KEY, entry.index)
                    .await
                    .map_err(|e| {
                        warn!("Failed to persist last_applied={}: {}", entry.index, e);
                        e
                    })?;
                last_applied = entry.index;
                applied += 1;
            }
        }

        if applied > 0 {
            debug!("Applied {} entries, last_applied={}", applied, last_applied);
        }
        Ok(applied)
    }

    // === Conflict resolution ===

    /// The closest stored entry below `entry.index`, with the current commit
    /// index. `None` when `entry` is the first entry of the log.
    pub async fn get_entry_info_before(&self, entry: &Entry) -> LogResult<Option<EntryInfo>> {
        if entry.index == 0 {
            return Err(ValidationError::InvalidIndex(entry.index).into());
        }

        let last_log_index = self.get_last_log_index().await?;
        let index = (entry.index - 1).min(last_log_index);
        if index == 0 {
            return Ok(None);
        }

        let Some(term) = self.log.get_log_term(index).await? else {
            return Ok(None);
        };
        Ok(Some(EntryInfo {
            index,
            term,
            committed_index: self.get_commit_index().await?,
        }))
    }

    /// Entries after the commit index, up to and including `index`.
    pub async fn get_uncommitted_entries_up_to_index(&self, index: u64) -> LogResult<Vec<Entry>> {
        let commit_index = self.get_commit_index().await?;
        if index <= commit_index {
            return Ok(Vec::new());
        }
        let entries = self
            .log
            .get_log_entries(commit_index + 1, index.saturating_add(1))
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| Entry::from_log_entry(e, commit_index))
            .collect())
    }

    /// Close the log and metadata stores. Calling it again is a no-op.
    pub async fn close(&self) -> LogResult<()> {
        let log_result = self.log.close().await;
        let meta_result = self.meta.close().await;
        log_result?;
        meta_result?;
        Ok(())
    }
}
