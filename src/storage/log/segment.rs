use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::message::LogEntry;

use super::entry::{ENTRY_HEADER_SIZE, EntryHeader, EntryMeta, deserialize_log_entry};

// LogSegment file format:
// | EntryHeader [ entry | commit | truncateSuffix | meta ] | EntryHeader [...] | ...
//
// The file is only ever appended to. The single exception is cutting a torn
// tail, either right after a failed write or when replay finds one.

/// One append-only file of framed records.
pub struct LogSegment {
    pub(crate) file_name: PathBuf,
    pub(crate) file: Arc<File>,
    /// Length of the valid prefix of the file. Every frame below it is intact.
    len: u64,
    sync_on_write: bool,
    /// Set when a failed write left bytes behind that could not be cut.
    poisoned: bool,
}

impl LogSegment {
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self> {
        let file_name = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&file_name)
            .map_err(|e| {
                warn!("Failed to open log segment {:?}: {}", file_name, e);
                e
            })?;
        let len = file.metadata()?.len();

        Ok(Self {
            file_name,
            file: Arc::new(file),
            len,
            sync_on_write,
            poisoned: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    /// Write already framed records with a single `write_all`.
    ///
    /// Returns the file offset of the first frame. If the write or the sync
    /// fails, the file is cut back to its previous length so that no partial
    /// frame survives.
    pub fn append_frames(&mut self, frames: &[Vec<u8>]) -> Result<u64> {
        if self.poisoned {
            return Err(anyhow!(
                "Log segment {:?} holds a partial write and must be reopened",
                self.file_name
            ));
        }
        let start = self.len;
        let buff = frames.iter().fold(Vec::new(), |mut acc, frame| {
            acc.extend_from_slice(frame);
            acc
        });
        if buff.is_empty() {
            return Ok(start);
        }

        let written = (&*self.file).write_all(&buff).map_err(anyhow::Error::from).and_then(|_| {
            if self.sync_on_write {
                self.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            warn!("Failed to append {} frames to {:?}: {}", frames.len(), self.file_name, e);
            self.roll_back(start);
            return Err(e);
        }

        self.len += buff.len() as u64;
        Ok(start)
    }

    /// Cut the file back to `start` after a failed write.
    ///
    /// When the cut itself fails, `len` is taken from the file so that it
    /// keeps matching where the next append lands. Any leftover bytes poison
    /// the segment: appending after them would bury a partial frame in the
    /// middle of the file.
    fn roll_back(&mut self, start: u64) {
        let Err(e) = self.file.set_len(start) else {
            return;
        };
        warn!("Failed to roll back log segment to {} bytes: {}", start, e);
        match self.file.metadata() {
            Ok(meta) if meta.len() == start => {}
            Ok(meta) => {
                warn!(
                    "Log segment {:?} keeps {} bytes of a failed write",
                    self.file_name,
                    meta.len().saturating_sub(start)
                );
                self.len = meta.len();
                self.poisoned = true;
            }
            Err(e) => {
                warn!("Failed to stat log segment {:?}: {}", self.file_name, e);
                self.poisoned = true;
            }
        }
    }

    /// Read every intact frame in order, stopping at the first damaged one.
    ///
    /// Returns the offset just past the last frame handed to `visit`. Bytes
    /// beyond it are a torn or corrupted tail.
    pub fn scan<F>(&self, mut visit: F) -> Result<u64>
    where
        F: FnMut(u64, &EntryHeader, &[u8]) -> Result<()>,
    {
        let file_size = self.file.metadata()?.len();
        let mut offset: u64 = 0;
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE as usize];

        while offset < file_size {
            if offset + ENTRY_HEADER_SIZE as u64 > file_size {
                warn!("Incomplete header at offset {}, stopping replay", offset);
                break;
            }

            self.file.read_exact_at(&mut header_buf, offset)?;
            let header = match EntryHeader::deserialize(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!("Failed to deserialize header at offset {}: {}", offset, e);
                    break;
                }
            };

            let data_offset = offset + ENTRY_HEADER_SIZE as u64;
            let data_size = header.payload_size();
            if data_offset + data_size > file_size {
                warn!("Incomplete frame at offset {}, stopping replay", offset);
                break;
            }

            let mut data_buf = vec![0u8; data_size as usize];
            self.file.read_exact_at(&mut data_buf, data_offset)?;

            let actual_crc = crc32fast::hash(&data_buf);
            if actual_crc != header.crc {
                warn!(
                    "CRC mismatch at offset {}: expected {}, got {}",
                    offset, header.crc, actual_crc
                );
                break;
            }

            visit(offset, &header, &data_buf)?;
            offset += header.size as u64;
        }

        Ok(offset)
    }

    /// Cut the file back to `len` bytes.
    pub fn truncate_tail(&mut self, len: u64) -> Result<()> {
        let file_size = self.file.metadata()?.len();
        if len >= file_size {
            self.len = file_size;
            return Ok(());
        }
        info!(
            "Cutting {} trailing bytes from {:?}",
            file_size - len,
            self.file_name
        );
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

/// Read the entries described by `metas` from `file`.
///
/// Metas whose frames sit back to back are fetched with one positioned read;
/// each run is read on the blocking pool, at most as many at once as the
/// semaphore allows.
pub(crate) async fn read_entries(
    file: Arc<File>,
    io_semaphore: Arc<Semaphore>,
    metas: Vec<EntryMeta>,
) -> Result<Vec<LogEntry>> {
    let mut runs: Vec<Vec<EntryMeta>> = Vec::new();
    for meta in metas {
        match runs.last_mut() {
            Some(run)
                if run.last().is_some_and(|last| {
                    last.offset + last.size + ENTRY_HEADER_SIZE as u64 == meta.offset
                }) =>
            {
                run.push(meta)
            }
            _ => runs.push(vec![meta]),
        }
    }

    let mut tasks = Vec::with_capacity(runs.len());
    for run in runs {
        let permit = io_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("I/O semaphore closed: {}", e))?;
        let file = file.clone();

        tasks.push(tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>> {
            let _permit = permit;
            let (Some(first), Some(last)) = (run.first(), run.last()) else {
                return Ok(Vec::new());
            };
            let start = first.offset;
            let end = last.offset + last.size;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact_at(&mut buf, start)?;

            run.iter()
                .map(|meta| {
                    let at = (meta.offset - start) as usize;
                    let entry = deserialize_log_entry(&buf[at..at + meta.size as usize])?;
                    if entry.index != meta.log_index {
                        return Err(anyhow!(
                            "Entry at offset {} has index {}, expected {}",
                            meta.offset,
                            entry.index,
                            meta.log_index
                        ));
                    }
                    Ok(entry)
                })
                .collect()
        }));
    }

    let results = futures::future::join_all(tasks).await;
    results
        .into_iter()
        .try_fold(Vec::new(), |mut acc, join_res| -> Result<Vec<LogEntry>> {
            let batch = join_res.map_err(|e| anyhow!("Task join error: {}", e))??;
            acc.extend(batch);
            Ok(acc)
        })
}
