use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::sync::{self, Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::{
    error::StorageError,
    message::LogEntry,
    traits::{LogEntryStorage, StorageResult},
};

use super::{
    entry::{
        CommitRecord, ENTRY_HEADER_SIZE, EntryHeader, EntryIndex, EntryMeta, RecordType,
        TruncateRecord, deserialize_log_entry, serialize_log_entry,
    },
    segment::{LogSegment, read_entries},
};

#[derive(Clone, Debug)]
pub struct LogEntryStoreOptions {
    /// Segment file holding the log
    pub path: PathBuf,
    /// Whether to sync after each write
    pub sync_on_write: bool,
    /// Maximum number of queued operations handled per writer round
    pub batch_size: usize,
    /// Number of most recent entries kept in memory
    pub cache_entries_size: usize,
    /// Maximum number of concurrent blocking reads
    pub max_io_threads: usize,
}

impl Default for LogEntryStoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/raft_log.seg"),
            sync_on_write: true,
            batch_size: 100,
            cache_entries_size: 1000,
            max_io_threads: 4,
        }
    }
}

pub struct LogEntryStoreInner {
    pub(crate) segment: RwLock<LogSegment>,
    pub(crate) entry_index: RwLock<EntryIndex>,
    pub(crate) cache: RwLock<VecDeque<LogEntry>>,
    pub(crate) cache_entries_size: usize,
    pub(crate) io_semaphore: Arc<Semaphore>,
    pub(crate) closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub enum LogEntryOp {
    /// Append one entry at the next free index.
    AppendNew { term: u64, command: String },
    /// Append entries that carry their own indices.
    Append(Vec<LogEntry>),
    TruncateLogSuffix(u64),
    Close,
}

pub struct LogEntryOpRequest {
    pub log_entry_op: LogEntryOp,
    /// Answered with the last log index after the operation.
    pub response_tx: sync::oneshot::Sender<StorageResult<u64>>,
}

/// File-backed log store.
///
/// Reads are served from the in-memory index, the recent-entries cache, and
/// positioned reads of the segment file. Every mutation is queued to a single
/// writer task, which must be started with [`FileLogStore::start`].
#[derive(Clone)]
pub struct FileLogStore {
    pub(crate) options: LogEntryStoreOptions,
    pub(crate) inner: Arc<LogEntryStoreInner>,
    op_sender: mpsc::UnboundedSender<LogEntryOpRequest>,
}

impl FileLogStore {
    /// Open (or create) the segment at `options.path` and rebuild the index
    /// from it. Returns the store along with the receiver that should be
    /// passed to [`FileLogStore::start`].
    pub fn new(
        options: LogEntryStoreOptions,
    ) -> StorageResult<(Self, mpsc::UnboundedReceiver<LogEntryOpRequest>)> {
        if let Some(dir) = options.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut segment = LogSegment::open(&options.path, options.sync_on_write)?;
        let entry_index = LogEntryStoreInner::replay(&mut segment)?;
        info!(
            "Opened log segment {:?}: last_log_index={}",
            options.path,
            entry_index.last_log_index()
        );

        let inner = LogEntryStoreInner {
            segment: RwLock::new(segment),
            entry_index: RwLock::new(entry_index),
            cache: RwLock::new(VecDeque::new()),
            cache_entries_size: options.cache_entries_size,
            io_semaphore: Arc::new(Semaphore::new(options.max_io_threads.max(1))),
            closed: AtomicBool::new(false),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                options,
                inner: Arc::new(inner),
                op_sender: tx,
            },
            rx,
        ))
    }

    /// Start the writer task.
    ///
    /// Operations are processed in arrival order. Consecutive appends that
    /// arrive together are written with one write and one sync; each request
    /// still succeeds or fails on its own. The task exits on `Close` or once
    /// every handle to the store is dropped.
    pub fn start(&self, mut receiver: mpsc::UnboundedReceiver<LogEntryOpRequest>) {
        let inner = self.inner.clone();
        let batch_size = self.options.batch_size.max(1);

        tokio::spawn(async move {
            loop {
                let mut buf = Vec::with_capacity(batch_size);
                let size = receiver.recv_many(&mut buf, batch_size).await;
                if size == 0 {
                    debug!("Log entry receiver closed");
                    break;
                }

                let mut results: Vec<StorageResult<u64>> = Vec::with_capacity(buf.len());
                let mut closing = false;

                let mut i = 0;
                while i < buf.len() {
                    if closing {
                        results.push(Err(StorageError::Closed));
                        i += 1;
                        continue;
                    }
                    match &buf[i].log_entry_op {
                        LogEntryOp::AppendNew { .. } | LogEntryOp::Append(_) => {
                            let start = i;
                            while i < buf.len()
                                && matches!(
                                    &buf[i].log_entry_op,
                                    LogEntryOp::AppendNew { .. } | LogEntryOp::Append(_)
                                )
                            {
                                i += 1;
                            }
                            let ops: Vec<&LogEntryOp> =
                                buf[start..i].iter().map(|req| &req.log_entry_op).collect();
                            results.extend(inner.append_batches(&ops));
                        }
                        LogEntryOp::TruncateLogSuffix(index) => {
                            results.push(inner.truncate_log_suffix(*index));
                            i += 1;
                        }
                        LogEntryOp::Close => {
                            results.push(inner.close());
                            closing = true;
                            i += 1;
                        }
                    }
                }

                for (req, result) in buf.into_iter().zip(results.into_iter()) {
                    let _ = req.response_tx.send(result);
                }

                if closing {
                    break;
                }
            }
        });
    }

    async fn submit(&self, log_entry_op: LogEntryOp) -> StorageResult<u64> {
        let (tx, rx) = sync::oneshot::channel();
        let request = LogEntryOpRequest {
            log_entry_op,
            response_tx: tx,
        };

        self.op_sender.send(request).map_err(|e| {
            warn!("Failed to send log entry operation: {}", e);
            self.inner.closed_error()
        })?;

        rx.await.map_err(|e| {
            warn!("Failed to receive log entry operation response: {}", e);
            self.inner.closed_error()
        })?
    }
}

impl LogEntryStoreInner {
    /// Rebuild the index by replaying the segment.
    ///
    /// Entry frames only count once the commit record closing their append
    /// has been read. A torn tail, whether an incomplete frame or entries
    /// without their commit record, is cut from the file.
    fn replay(segment: &mut LogSegment) -> StorageResult<EntryIndex> {
        let mut index = EntryIndex::default();
        let mut pending: Vec<EntryMeta> = Vec::new();
        let mut committed_len: u64 = 0;

        segment
            .scan(|offset, header, data| {
                match header.record_type {
                    RecordType::Entry => {
                        let entry = deserialize_log_entry(data)?;
                        pending.push(EntryMeta {
                            log_index: entry.index,
                            term: entry.term,
                            offset: offset + ENTRY_HEADER_SIZE as u64,
                            size: data.len() as u64,
                        });
                    }
                    RecordType::Commit => {
                        let record = CommitRecord::deserialize(data)?;
                        check_commit(&index, &pending, &record)?;
                        index.extend(pending.drain(..));
                        committed_len = offset + header.size as u64;
                    }
                    RecordType::TruncateSuffix => {
                        if !pending.is_empty() {
                            return Err(anyhow!("Truncate record inside an open append"));
                        }
                        let record = TruncateRecord::deserialize(data)?;
                        index.truncate_suffix(record.truncate_index);
                        committed_len = offset + header.size as u64;
                    }
                    RecordType::Meta => {
                        return Err(anyhow!("Unexpected meta record in log segment"));
                    }
                }
                Ok(())
            })
            .map_err(|e| {
                warn!("Failed to replay log segment {:?}: {}", segment.file_name, e);
                StorageError::Corruption {
                    offset: committed_len,
                    reason: e.to_string(),
                }
            })?;

        if !pending.is_empty() {
            warn!(
                "Discarding {} entries of an append that never committed",
                pending.len()
            );
        }
        if committed_len < segment.len() {
            segment.truncate_tail(committed_len)?;
        }

        Ok(index)
    }

    fn closed_error(&self) -> StorageError {
        if self.closed.load(Ordering::Acquire) {
            StorageError::Closed
        } else {
            StorageError::ChannelClosed
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub(crate) fn append_to_cache(&self, entries: &[LogEntry]) {
        let mut cache = self.cache.write();
        for log_entry in entries {
            cache.push_back(log_entry.clone());
            if cache.len() > self.cache_entries_size {
                cache.pop_front();
            }
        }
    }

    pub(crate) fn truncate_cache_suffix(&self, index: u64) {
        let mut cache = self.cache.write();
        // Remove entries with index > truncate_index
        while let Some(back) = cache.back() {
            if back.index > index {
                cache.pop_back();
            } else {
                break;
            }
        }
    }

    /// Write a group of append operations.
    ///
    /// Each operation is checked against the index it would start at; those
    /// that do not continue the log are answered with `IndexConflict` and left
    /// out. The rest are written together, every one followed by its own
    /// commit record.
    pub(crate) fn append_batches(&self, ops: &[&LogEntryOp]) -> Vec<StorageResult<u64>> {
        let mut results: Vec<Option<StorageResult<u64>>> = vec![None; ops.len()];
        if let Err(e) = self.ensure_open() {
            return vec![Err(e); ops.len()];
        }

        let mut segment = self.segment.write();
        let mut next_index = self.entry_index.read().last_log_index() + 1;

        let mut frames = Vec::new();
        let mut frame_len: u64 = 0;
        // (op position, entries, metas with offsets relative to the write)
        let mut accepted: Vec<(usize, Vec<LogEntry>, Vec<EntryMeta>)> = Vec::new();

        for (pos, op) in ops.iter().enumerate() {
            let entries = match op {
                LogEntryOp::AppendNew { term, command } => {
                    vec![LogEntry::new(next_index, *term, command.clone())]
                }
                LogEntryOp::Append(entries) => entries.clone(),
                LogEntryOp::TruncateLogSuffix(_) | LogEntryOp::Close => {
                    results[pos] = Some(Err(anyhow!("Not an append operation").into()));
                    continue;
                }
            };

            if let Err(e) = check_contiguous(next_index, &entries) {
                warn!("Rejecting append: {}", e);
                results[pos] = Some(Err(e));
                continue;
            }

            match build_frames(&entries, frame_len) {
                Ok((op_frames, metas, len)) => {
                    frames.extend(op_frames);
                    frame_len += len;
                    next_index += entries.len() as u64;
                    accepted.push((pos, entries, metas));
                }
                Err(e) => {
                    warn!("Failed to encode log entries: {}", e);
                    results[pos] = Some(Err(e));
                }
            }
        }

        if !accepted.is_empty() {
            match segment.append_frames(&frames) {
                Ok(start) => {
                    let mut entry_index = self.entry_index.write();
                    for (pos, entries, metas) in accepted {
                        entry_index.extend(metas.into_iter().map(|mut meta| {
                            meta.offset += start;
                            meta
                        }));
                        self.append_to_cache(&entries);
                        let last = entries.last().map_or(0, |e| e.index);
                        results[pos] = Some(Ok(last));
                    }
                }
                Err(e) => {
                    warn!("Failed to append log entries to segment: {}", e);
                    let err = StorageError::from(e);
                    for (pos, _, _) in accepted {
                        results[pos] = Some(Err(err.clone()));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(StorageError::ChannelClosed)))
            .collect()
    }

    /// Truncate log entries after the given index.
    /// This operation is append-only - it writes a truncate record to the segment
    /// and updates the in-memory index
    pub(crate) fn truncate_log_suffix(&self, index: u64) -> StorageResult<u64> {
        self.ensure_open()?;

        let mut segment = self.segment.write();
        let last = self.entry_index.read().last_log_index();
        if index >= last {
            return Ok(last);
        }

        let data = TruncateRecord {
            truncate_index: index,
        }
        .serialize()?;
        segment
            .append_frames(&[EntryHeader::frame(RecordType::TruncateSuffix, &data)])
            .map_err(|e| {
                warn!("Failed to write truncate suffix to segment: {}", e);
                StorageError::from(e)
            })?;

        self.entry_index.write().truncate_suffix(index);
        self.truncate_cache_suffix(index);
        info!("Truncated log after index {} (was {})", index, last);
        Ok(index)
    }

    fn close(&self) -> StorageResult<u64> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(self.entry_index.read().last_log_index());
        }
        let segment = self.segment.read();
        segment.sync_data()?;
        info!("Closed log segment {:?}", segment.file_name);
        Ok(self.entry_index.read().last_log_index())
    }

    /// Get log entries from cache if the whole range is cached
    fn get_from_cache(&self, low: u64, high: u64) -> Option<Vec<LogEntry>> {
        let cache = self.cache.read();
        let first_cached = cache.front()?.index;
        let last_cached = cache.back()?.index;

        if low >= first_cached && high <= last_cached + 1 {
            let start_offset = (low - first_cached) as usize;
            let count = (high - low) as usize;

            let entries: Vec<LogEntry> = cache
                .iter()
                .skip(start_offset)
                .take(count)
                .cloned()
                .collect();

            if entries.len() == count {
                return Some(entries);
            }
        }
        None
    }

    pub(crate) async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.ensure_open()?;

        // Clamp the range and copy the metas out without holding the lock across await
        let (low, high, metas) = {
            let entry_index = self.entry_index.read();
            let low = low.max(1);
            let high = high.min(entry_index.last_log_index() + 1);
            if low >= high {
                return Ok(Vec::new());
            }
            (low, high, entry_index.range(low, high).to_vec())
        };

        if let Some(entries) = self.get_from_cache(low, high) {
            return Ok(entries);
        }

        let file = self.segment.read().file.clone();
        read_entries(file, self.io_semaphore.clone(), metas)
            .await
            .map_err(|e| {
                warn!("Failed to read log entries [{}, {}): {}", low, high, e);
                StorageError::from(e)
            })
    }

    pub(crate) fn get_last_log_index(&self) -> StorageResult<(u64, u64)> {
        self.ensure_open()?;
        Ok(self
            .entry_index
            .read()
            .last_entry()
            .map_or((0, 0), |meta| (meta.log_index, meta.term)))
    }

    pub(crate) fn get_log_term(&self, idx: u64) -> StorageResult<Option<u64>> {
        self.ensure_open()?;
        Ok(self.entry_index.read().get_entry(idx).map(|meta| meta.term))
    }

    pub(crate) fn has_log_entry(&self, idx: u64) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.entry_index.read().is_valid_index(idx))
    }
}

fn check_contiguous(next_index: u64, entries: &[LogEntry]) -> StorageResult<()> {
    let mut expected = next_index;
    for entry in entries {
        if entry.index != expected {
            return Err(StorageError::IndexConflict {
                expected,
                found: entry.index,
            });
        }
        expected += 1;
    }
    Ok(())
}

fn check_commit(
    index: &EntryIndex,
    pending: &[EntryMeta],
    record: &CommitRecord,
) -> anyhow::Result<()> {
    let (Some(first), Some(last)) = (pending.first(), pending.last()) else {
        return Err(anyhow!("Commit record without entries"));
    };
    if first.log_index != record.first_index || last.log_index != record.last_index {
        return Err(anyhow!(
            "Commit record [{}, {}] does not match entries [{}, {}]",
            record.first_index,
            record.last_index,
            first.log_index,
            last.log_index
        ));
    }
    let mut expected = index.last_log_index() + 1;
    for meta in pending {
        if meta.log_index != expected {
            return Err(anyhow!(
                "Entry {} does not continue the log at {}",
                meta.log_index,
                expected
            ));
        }
        expected += 1;
    }
    Ok(())
}

/// Frame `entries` followed by their commit record. `base` is the number of
/// bytes already queued ahead of them in the same write.
fn build_frames(
    entries: &[LogEntry],
    base: u64,
) -> StorageResult<(Vec<Vec<u8>>, Vec<EntryMeta>, u64)> {
    let mut frames = Vec::with_capacity(entries.len() + 1);
    let mut metas = Vec::with_capacity(entries.len());
    let mut offset = base;

    for entry in entries {
        let payload = serialize_log_entry(entry)?;
        metas.push(EntryMeta {
            log_index: entry.index,
            term: entry.term,
            offset: offset + ENTRY_HEADER_SIZE as u64,
            size: payload.len() as u64,
        });
        let frame = EntryHeader::frame(RecordType::Entry, &payload);
        offset += frame.len() as u64;
        frames.push(frame);
    }

    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Ok((frames, metas, 0));
    };
    let commit = CommitRecord {
        first_index: first.index,
        last_index: last.index,
    }
    .serialize()?;
    let frame = EntryHeader::frame(RecordType::Commit, &commit);
    offset += frame.len() as u64;
    frames.push(frame);

    Ok((frames, metas, offset - base))
}

#[async_trait::async_trait]
impl LogEntryStorage for FileLogStore {
    async fn append_entry(&self, term: u64, command: String) -> StorageResult<u64> {
        self.submit(LogEntryOp::AppendNew { term, command }).await
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.submit(LogEntryOp::Append(entries.to_vec()))
            .await
            .map(|_| ())
    }

    async fn get_log_entry(&self, idx: u64) -> StorageResult<Option<LogEntry>> {
        let mut entries = self.inner.get_log_entries(idx, idx.saturating_add(1)).await?;
        Ok(entries.pop())
    }

    async fn get_log_entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        self.inner.get_log_entries(low, high).await
    }

    async fn get_log_term(&self, idx: u64) -> StorageResult<Option<u64>> {
        self.inner.get_log_term(idx)
    }

    async fn get_last_log_index(&self) -> StorageResult<(u64, u64)> {
        self.inner.get_last_log_index()
    }

    async fn has_log_entry(&self, idx: u64) -> StorageResult<bool> {
        self.inner.has_log_entry(idx)
    }

    async fn truncate_log_suffix(&self, idx: u64) -> StorageResult<()> {
        self.submit(LogEntryOp::TruncateLogSuffix(idx))
            .await
            .map(|_| ())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.submit(LogEntryOp::Close).await {
            Ok(_) | Err(StorageError::Closed) => Ok(()),
            Err(StorageError::ChannelClosed) => {
                // Writer already gone; nothing left to flush.
                self.inner.closed.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
