//! Log storage for a single Raft node.
//!
//! Entries, commit records and truncate records are appended to one segment
//! file and never rewritten in place. An in-memory index of valid entries is
//! rebuilt by replaying the segment on open.
//!
//! # Module Structure
//!
//! - `entry`: Frame header, record payloads and the entry index
//! - `segment`: Append-only segment file operations
//! - `store`: File-backed log store with a single writer task and a read cache

mod entry;
mod segment;
mod store;

#[cfg(test)]
mod tests;

pub use entry::{
    CommitRecord, ENTRY_HEADER_SIZE, ENTRY_MAGIC_NUM, EntryHeader, EntryIndex, EntryMeta,
    MetaRecord, RecordType, TruncateRecord,
};

pub use segment::LogSegment;

pub use store::{FileLogStore, LogEntryOp, LogEntryOpRequest, LogEntryStoreOptions};
