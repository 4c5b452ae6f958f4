//! Durable key to integer metadata (`commit_index`, `last_applied`).
//!
//! Every update appends one `Meta` frame to its own segment file; replay keeps
//! the last value per key. Once the file holds more frames than
//! `compact_threshold`, it is rewritten with a single frame per key.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::StorageError,
    traits::{COMMIT_INDEX_KEY, LAST_APPLIED_KEY, MetaStorage, StorageResult},
};

use super::log::{EntryHeader, LogSegment, MetaRecord, RecordType};

#[derive(Clone, Debug)]
pub struct MetaStoreOptions {
    /// Segment file holding the metadata
    pub path: PathBuf,
    /// Whether to sync after each write
    pub sync_on_write: bool,
    /// Number of frames after which the file is compacted
    pub compact_threshold: usize,
}

impl Default for MetaStoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/raft_meta.seg"),
            sync_on_write: true,
            compact_threshold: 4096,
        }
    }
}

struct MetaInner {
    segment: LogSegment,
    values: BTreeMap<String, u64>,
    /// Frames currently in the file.
    records: usize,
    /// `segment` still points at a file that was renamed away.
    needs_reopen: bool,
}

pub struct FileMetaStore {
    options: MetaStoreOptions,
    inner: Mutex<MetaInner>,
    closed: AtomicBool,
}

fn meta_frame(key: &str, value: u64) -> Result<Vec<u8>> {
    let data = MetaRecord {
        key: key.to_string(),
        value,
    }
    .serialize()?;
    Ok(EntryHeader::frame(RecordType::Meta, &data))
}

fn replace_file(tmp_path: &Path, path: &Path, frames: &[Vec<u8>]) -> Result<()> {
    let mut file = File::create(tmp_path)?;
    for frame in frames {
        file.write_all(frame)?;
    }
    file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

impl FileMetaStore {
    /// Open the metadata file, creating it when missing. Keys that have never
    /// been written are seeded with `0`; existing values are preserved.
    pub fn open(options: MetaStoreOptions) -> StorageResult<Self> {
        if let Some(dir) = options.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut segment = LogSegment::open(&options.path, options.sync_on_write)?;
        let mut values = BTreeMap::new();
        let mut records = 0;

        let end = segment
            .scan(|_, header, data| {
                if header.record_type != RecordType::Meta {
                    return Err(anyhow!("Unexpected {:?} record in meta file", header.record_type));
                }
                let record = MetaRecord::deserialize(data)?;
                values.insert(record.key, record.value);
                records += 1;
                Ok(())
            })
            .map_err(|e| {
                warn!("Failed to replay meta file {:?}: {}", options.path, e);
                StorageError::Corruption {
                    offset: 0,
                    reason: e.to_string(),
                }
            })?;
        if end < segment.len() {
            segment.truncate_tail(end)?;
        }

        let mut seeds = Vec::new();
        for key in [COMMIT_INDEX_KEY, LAST_APPLIED_KEY] {
            if !values.contains_key(key) {
                seeds.push(meta_frame(key, 0)?);
                values.insert(key.to_string(), 0);
            }
        }
        if !seeds.is_empty() {
            records += seeds.len();
            segment.append_frames(&seeds)?;
            info!("Initialized metadata in {:?}", options.path);
        }

        Ok(Self {
            options,
            inner: Mutex::new(MetaInner {
                segment,
                values,
                records,
                needs_reopen: false,
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Rewrite the file with one frame per key: write a temporary file, sync
    /// it, then rename it over the live one.
    ///
    /// Failures before the rename leave the live file in use. Once the rename
    /// went through, the handle must be swapped to the new file; if that
    /// fails, the store refuses writes until a reopen succeeds.
    fn compact(&self, inner: &mut MetaInner) -> Result<()> {
        let tmp_path = self.options.path.with_extension("seg.tmp");
        let frames = inner
            .values
            .iter()
            .map(|(key, value)| meta_frame(key, *value))
            .collect::<Result<Vec<_>>>()?;

        if let Err(e) = replace_file(&tmp_path, &self.options.path, &frames) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let compacted_from = inner.records;
        inner.records = frames.len();
        inner.needs_reopen = true;
        self.reopen(inner)?;

        if let Some(dir) = self.options.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
                warn!("Failed to sync directory {:?}: {}", dir, e);
            }
        }

        debug!(
            "Compacted meta file {:?} from {} to {} records",
            self.options.path, compacted_from, inner.records
        );
        Ok(())
    }

    /// Point the store at the file currently at `options.path`.
    fn reopen(&self, inner: &mut MetaInner) -> Result<()> {
        inner.segment = LogSegment::open(&self.options.path, self.options.sync_on_write)?;
        inner.needs_reopen = false;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetaStorage for FileMetaStore {
    async fn get_meta(&self, key: &str) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.inner.lock().values.get(key).copied().unwrap_or(0))
    }

    async fn set_meta(&self, key: &str, value: u64) -> StorageResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        if inner.needs_reopen {
            self.reopen(&mut inner).map_err(|e| {
                warn!("Failed to reopen meta file {:?}: {}", self.options.path, e);
                StorageError::from(e)
            })?;
        }

        let frame = meta_frame(key, value)?;
        inner.segment.append_frames(&[frame]).map_err(|e| {
            warn!("Failed to write meta {}={}: {}", key, value, e);
            StorageError::from(e)
        })?;
        inner.values.insert(key.to_string(), value);
        inner.records += 1;

        if inner.records > self.options.compact_threshold {
            if let Err(e) = self.compact(&mut inner) {
                warn!("Failed to compact meta file {:?}: {}", self.options.path, e);
                if inner.needs_reopen {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.lock();
        inner.segment.sync_data()?;
        info!("Closed meta file {:?}", self.options.path);
        Ok(())
    }
}
