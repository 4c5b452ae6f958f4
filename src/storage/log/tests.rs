//! Unit tests for the log storage module.

#[cfg(test)]
mod entry_tests {
    use crate::message::LogEntry;
    use crate::storage::log::entry::*;

    fn meta(log_index: u64, term: u64) -> EntryMeta {
        EntryMeta {
            log_index,
            term,
            offset: log_index * 10,
            size: 10,
        }
    }

    fn index_with(count: u64) -> EntryIndex {
        let mut index = EntryIndex::default();
        index.extend((1..=count).map(|i| meta(i, 1)));
        index
    }

    #[test]
    fn test_entry_header_roundtrip() {
        let header = EntryHeader::new(RecordType::Commit, b"payload");
        let bytes = header.serialize();
        let decoded = EntryHeader::deserialize(&bytes).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_size(), 7);
        assert_eq!(decoded.crc, crc32fast::hash(b"payload"));
    }

    #[test]
    fn test_entry_header_rejects_bad_input() {
        let mut bytes = EntryHeader::new(RecordType::Entry, b"x").serialize();
        assert!(EntryHeader::deserialize(&bytes[..8]).is_err());

        bytes[8] ^= 0xff;
        assert!(EntryHeader::deserialize(&bytes).is_err());

        let mut bytes = EntryHeader::new(RecordType::Entry, b"x").serialize();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(EntryHeader::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_frame_layout() {
        let frame = EntryHeader::frame(RecordType::Meta, b"abc");
        assert_eq!(frame.len(), ENTRY_HEADER_SIZE as usize + 3);
        assert_eq!(&frame[ENTRY_HEADER_SIZE as usize..], b"abc");
    }

    #[test]
    fn test_record_serialization() {
        let truncate = TruncateRecord { truncate_index: 100 };
        assert_eq!(
            TruncateRecord::deserialize(&truncate.serialize().unwrap()).unwrap(),
            truncate
        );

        let commit = CommitRecord {
            first_index: 3,
            last_index: 9,
        };
        assert_eq!(
            CommitRecord::deserialize(&commit.serialize().unwrap()).unwrap(),
            commit
        );

        let entry = LogEntry::new(4, 2, "set x 1");
        let bytes = serialize_log_entry(&entry).unwrap();
        assert_eq!(deserialize_log_entry(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_entry_index_lookup() {
        let index = index_with(3);

        assert_eq!(index.last_log_index(), 3);
        assert!(index.is_valid_index(1));
        assert!(index.is_valid_index(3));
        assert!(!index.is_valid_index(0));
        assert!(!index.is_valid_index(4));
        assert_eq!(index.get_entry(2).unwrap().log_index, 2);
        assert!(index.get_entry(4).is_none());
    }

    #[test]
    fn test_entry_index_range_is_clamped() {
        let index = index_with(5);

        let range = index.range(0, 10);
        assert_eq!(range.len(), 5);
        assert_eq!(range[0].log_index, 1);

        assert_eq!(index.range(2, 4).len(), 2);
        assert!(index.range(4, 4).is_empty());
        assert!(index.range(6, 10).is_empty());
        assert!(index.range(5, 2).is_empty());
    }

    #[test]
    fn test_entry_index_truncate_suffix() {
        let mut index = index_with(5);

        index.truncate_suffix(3);
        assert_eq!(index.last_log_index(), 3);
        assert_eq!(index.last_entry().unwrap().log_index, 3);

        // Truncating at or past the end is a no-op
        index.truncate_suffix(3);
        index.truncate_suffix(10);
        assert_eq!(index.last_log_index(), 3);

        index.truncate_suffix(0);
        assert_eq!(index.last_log_index(), 0);
        assert!(index.last_entry().is_none());
    }
}

#[cfg(test)]
mod segment_tests {
    use std::{
        fs::{File, OpenOptions},
        io::Write,
        path::Path,
        sync::Arc,
    };

    use tempfile::TempDir;

    use crate::storage::log::LogSegment;
    use crate::storage::log::entry::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        EntryHeader::frame(RecordType::Commit, payload)
    }

    fn writable(path: &Path) -> Arc<File> {
        Arc::new(OpenOptions::new().read(true).append(true).open(path).unwrap())
    }

    #[test]
    fn test_failed_write_leaves_segment_length_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("raft_log.seg");
        let mut segment = LogSegment::open(&path, true).unwrap();
        segment.append_frames(&[frame(b"first")]).unwrap();
        let len = segment.len();

        // Writes through a read-only handle fail
        segment.file = Arc::new(File::open(&path).unwrap());
        assert!(segment.append_frames(&[frame(b"second")]).is_err());
        assert_eq!(segment.len(), len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

        segment.file = writable(&path);
        assert_eq!(segment.append_frames(&[frame(b"third")]).unwrap(), len);

        let mut payloads = Vec::new();
        let end = segment
            .scan(|_, _, data| {
                payloads.push(data.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(end, segment.len());
        assert_eq!(payloads, vec![b"first".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_leftover_bytes_of_failed_write_block_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("raft_log.seg");
        let mut segment = LogSegment::open(&path, true).unwrap();
        segment.append_frames(&[frame(b"first")]).unwrap();
        let len = segment.len();

        // Part of a frame reached the disk and cannot be cut
        segment.file = Arc::new(File::open(&path).unwrap());
        (&*writable(&path)).write_all(b"torn").unwrap();
        assert!(segment.append_frames(&[frame(b"second")]).is_err());
        assert_eq!(segment.len(), len + 4);

        segment.file = writable(&path);
        assert!(segment.append_frames(&[frame(b"third")]).is_err());

        // Reopening cuts the torn bytes and accepts writes again
        let mut segment = LogSegment::open(&path, true).unwrap();
        let end = segment.scan(|_, _, _| Ok(())).unwrap();
        assert_eq!(end, len);
        segment.truncate_tail(end).unwrap();
        assert_eq!(segment.append_frames(&[frame(b"third")]).unwrap(), len);
    }
}

#[cfg(test)]
mod store_tests {
    use std::{
        fs::{File, OpenOptions},
        io::Write,
        sync::Arc,
    };

    use tempfile::TempDir;

    use crate::error::StorageError;
    use crate::message::LogEntry;
    use crate::storage::log::entry::*;
    use crate::storage::log::{FileLogStore, LogEntryStoreOptions, LogSegment};
    use crate::traits::LogEntryStorage;

    fn options(dir: &TempDir) -> LogEntryStoreOptions {
        LogEntryStoreOptions {
            path: dir.path().join("raft_log.seg"),
            ..Default::default()
        }
    }

    fn open(options: &LogEntryStoreOptions) -> FileLogStore {
        let (store, rx) = FileLogStore::new(options.clone()).unwrap();
        store.start(rx);
        store
    }

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::new(i, term, format!("command_{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_append_assigns_sequential_indices() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&options(&temp_dir));

        assert_eq!(store.get_last_log_index().await.unwrap(), (0, 0));
        assert_eq!(store.append_entry(1, "a".to_string()).await.unwrap(), 1);
        assert_eq!(store.append_entry(2, "b".to_string()).await.unwrap(), 2);
        assert_eq!(store.get_last_log_index().await.unwrap(), (2, 2));
        assert_eq!(store.get_log_term(1).await.unwrap(), Some(1));
        assert_eq!(store.get_log_term(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_group_committed_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&options(&temp_dir));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append_entry(1, format!("cmd_{}", i)).await })
            })
            .collect();
        let mut indices = Vec::new();
        for task in tasks {
            indices.push(task.await.unwrap().unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (1..=20).collect::<Vec<_>>());

        let all = store.get_log_entries(1, 21).await.unwrap();
        assert_eq!(all.len(), 20);
        for (pos, entry) in all.iter().enumerate() {
            assert_eq!(entry.index, pos as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_append_entries_must_continue_the_log() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&options(&temp_dir));
        store.append_entries(&entries(1..=3, 1)).await.unwrap();

        // Overlapping index
        let result = store.append_entries(&entries(3..=4, 1)).await;
        assert!(matches!(
            result,
            Err(StorageError::IndexConflict {
                expected: 4,
                found: 3
            })
        ));

        // Gap
        let result = store.append_entries(&entries(5..=6, 1)).await;
        assert!(matches!(result, Err(StorageError::IndexConflict { .. })));

        assert_eq!(store.get_last_log_index().await.unwrap(), (3, 1));
        store.append_entries(&entries(4..=5, 2)).await.unwrap();
        assert_eq!(store.get_last_log_index().await.unwrap(), (5, 2));
    }

    #[tokio::test]
    async fn test_reads_bypass_cache() {
        let temp_dir = TempDir::new().unwrap();
        let opts = LogEntryStoreOptions {
            cache_entries_size: 2,
            ..options(&temp_dir)
        };
        let store = open(&opts);
        store.append_entries(&entries(1..=6, 1)).await.unwrap();

        // Only 5 and 6 are cached; the rest comes from the segment file
        assert_eq!(store.inner.cache.read().len(), 2);
        let read = store.get_log_entries(0, 100).await.unwrap();
        assert_eq!(read, entries(1..=6, 1));
        assert_eq!(
            store.get_log_entry(2).await.unwrap(),
            Some(LogEntry::new(2, 1, "command_2"))
        );
        assert_eq!(store.get_log_entry(0).await.unwrap(), None);
        assert_eq!(store.get_log_entry(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncate_then_append_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let opts = options(&temp_dir);
        {
            let store = open(&opts);
            store.append_entries(&entries(1..=5, 1)).await.unwrap();
            store.truncate_log_suffix(3).await.unwrap();
            assert!(!store.has_log_entry(4).await.unwrap());
            assert_eq!(store.append_entry(2, "new_4".to_string()).await.unwrap(), 4);
            store.close().await.unwrap();
        }

        let store = open(&opts);
        assert_eq!(store.get_last_log_index().await.unwrap(), (4, 2));
        let read = store.get_log_entries(1, 10).await.unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(read[2], LogEntry::new(3, 1, "command_3"));
        assert_eq!(read[3], LogEntry::new(4, 2, "new_4"));
    }

    #[tokio::test]
    async fn test_replay_discards_uncommitted_batch() {
        let temp_dir = TempDir::new().unwrap();
        let opts = options(&temp_dir);
        {
            let store = open(&opts);
            store.append_entries(&entries(1..=2, 1)).await.unwrap();
            store.close().await.unwrap();
        }

        // Entries 3 and 4 reached the disk but their commit record did not
        {
            let mut segment = LogSegment::open(&opts.path, true).unwrap();
            let frames: Vec<Vec<u8>> = entries(3..=4, 1)
                .iter()
                .map(|e| EntryHeader::frame(RecordType::Entry, &serialize_log_entry(e).unwrap()))
                .collect();
            segment.append_frames(&frames).unwrap();
        }

        let store = open(&opts);
        assert_eq!(store.get_last_log_index().await.unwrap(), (2, 1));
        assert_eq!(store.append_entry(3, "after_crash".to_string()).await.unwrap(), 3);
        store.close().await.unwrap();

        let store = open(&opts);
        assert_eq!(
            store.get_log_entry(3).await.unwrap(),
            Some(LogEntry::new(3, 3, "after_crash"))
        );
    }

    #[tokio::test]
    async fn test_replay_stops_at_crc_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let opts = options(&temp_dir);
        {
            let store = open(&opts);
            store.append_entries(&entries(1..=3, 1)).await.unwrap();
            store.close().await.unwrap();
        }

        let payload = serialize_log_entry(&LogEntry::new(4, 1, "command_4")).unwrap();
        let mut frame = EntryHeader::frame(RecordType::Entry, &payload);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut file = OpenOptions::new().append(true).open(&opts.path).unwrap();
        file.write_all(&frame).unwrap();
        drop(file);

        let store = open(&opts);
        assert_eq!(store.get_last_log_index().await.unwrap(), (3, 1));
        assert_eq!(
            std::fs::metadata(&opts.path).unwrap().len(),
            store.inner.segment.read().len()
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&options(&temp_dir));
        store.append_entry(1, "a".to_string()).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.append_entry(1, "b".to_string()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.get_log_entries(1, 2).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failed_segment_write_leaves_log_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let opts = options(&temp_dir);
        let store = open(&opts);
        store.append_entries(&entries(1..=3, 1)).await.unwrap();
        let len = store.inner.segment.read().len();

        store.inner.segment.write().file = Arc::new(File::open(&opts.path).unwrap());
        assert!(matches!(
            store.append_entry(2, "lost".to_string()).await,
            Err(StorageError::Io(_))
        ));
        assert!(store.append_entries(&entries(4..=5, 2)).await.is_err());
        assert!(store.truncate_log_suffix(1).await.is_err());

        assert_eq!(store.get_last_log_index().await.unwrap(), (3, 1));
        assert!(!store.has_log_entry(4).await.unwrap());
        assert_eq!(store.get_log_entries(1, 10).await.unwrap(), entries(1..=3, 1));
        assert_eq!(std::fs::metadata(&opts.path).unwrap().len(), len);

        store.inner.segment.write().file = Arc::new(
            OpenOptions::new()
                .read(true)
                .append(true)
                .open(&opts.path)
                .unwrap(),
        );
        assert_eq!(store.append_entry(2, "command_4".to_string()).await.unwrap(), 4);
        store.close().await.unwrap();

        let store = open(&opts);
        let mut expected = entries(1..=3, 1);
        expected.push(LogEntry::new(4, 2, "command_4"));
        assert_eq!(store.get_log_entries(1, 10).await.unwrap(), expected);
    }
}
