use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::Command;

/// A log entry as it is persisted. Commit status is not part of the stored
/// record; it is derived from the `commit_index` metadata on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: impl Into<Command>) -> Self {
        Self {
            index,
            term,
            command: command.into(),
        }
    }
}

/// A log entry as seen by readers, with its commit status at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
    pub committed: bool,
}

impl Entry {
    pub(crate) fn from_log_entry(entry: LogEntry, commit_index: u64) -> Self {
        Self {
            committed: entry.index <= commit_index,
            index: entry.index,
            term: entry.term,
            command: entry.command,
        }
    }
}

impl From<Entry> for LogEntry {
    fn from(entry: Entry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            command: entry.command,
        }
    }
}

/// Boundary information about the entry preceding a given one, used while
/// walking back to the last point where a follower agrees with its leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub index: u64,
    pub term: u64,
    pub committed_index: u64,
}
