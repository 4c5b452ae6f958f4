//! In-memory log and metadata storage (for tests and single-process use).
//!
//! Nothing survives the process. Writes can be made to fail on demand to
//! exercise error paths of callers.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;
use tracing::warn;

use crate::{
    error::StorageError,
    message::LogEntry,
    traits::{COMMIT_INDEX_KEY, LAST_APPLIED_KEY, LogEntryStorage, MetaStorage, StorageResult},
};

#[derive(Default)]
pub struct MemoryStorage {
    log: RwLock<Vec<LogEntry>>, // entries in index order, log[i].index == i + 1
    meta: RwLock<HashMap<String, u64>>,
    fail_log_writes: AtomicBool,
    fail_meta_writes: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let storage = Self::default();
        {
            let mut meta = storage.meta.write();
            meta.insert(COMMIT_INDEX_KEY.to_string(), 0);
            meta.insert(LAST_APPLIED_KEY.to_string(), 0);
        }
        storage
    }

    /// Make every following log mutation fail until turned off again.
    pub fn fail_log_writes(&self, fail: bool) {
        self.fail_log_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following metadata write fail until turned off again.
    pub fn fail_meta_writes(&self, fail: bool) {
        self.fail_meta_writes.store(fail, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check_log_write(&self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.fail_log_writes.load(Ordering::SeqCst) {
            warn!("Injected log write failure");
            return Err(StorageError::Injected("log write".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogEntryStorage for MemoryStorage {
    async fn append_entry(&self, term: u64, command: String) -> StorageResult<u64> {
        self.check_log_write()?;
        let mut log = self.log.write();
        let index = log.len() as u64 + 1;
        log.push(LogEntry::new(index, term, command));
        Ok(index)
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_log_write()?;
        let mut log = self.log.write();
        let mut expected = log.len() as u64 + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::IndexConflict {
                    expected,
                    found: entry.index,
                });
            }
            expected += 1;
        }
        log.extend_from_slice(entries);
        Ok(())
    }

    async fn get_log_entry(&self, idx: u64) -> StorageResult<Option<LogEntry>> {
        self.ensure_open()?;
        let log = self.log.read();
        Ok(idx
            .checked_sub(1)
            .and_then(|pos| log.get(pos as usize))
            .cloned())
    }

    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.ensure_open()?;
        let log = self.log.read();
        let low = low.max(1);
        let high = high.min(log.len() as u64 + 1);
        if low >= high {
            return Ok(Vec::new());
        }
        Ok(log[(low - 1) as usize..(high - 1) as usize].to_vec())
    }

    async fn get_log_term(&self, idx: u64) -> StorageResult<Option<u64>> {
        Ok(self.get_log_entry(idx).await?.map(|e| e.term))
    }

    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)> {
        self.ensure_open()?;
        Ok(self.log.read().last().map_or((0, 0), |e| (e.index, e.term)))
    }

    async fn has_log_entry(&self, idx: u64) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(idx >= 1 && idx <= self.log.read().len() as u64)
    }

    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()> {
        self.check_log_write()?;
        let mut log = self.log.write();
        if (idx as usize) < log.len() {
            log.truncate(idx as usize);
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetaStorage for MemoryStorage {
    async fn get_meta(&self, key: &str) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.meta.read().get(key).copied().unwrap_or(0))
    }

    async fn set_meta(&self, key: &str, value: u64) -> StorageResult<()> {
        self.ensure_open()?;
        if self.fail_meta_writes.load(Ordering::SeqCst) {
            warn!("Injected meta write failure for {}", key);
            return Err(StorageError::Injected(format!("meta write {}", key)));
        }
        self.meta.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
