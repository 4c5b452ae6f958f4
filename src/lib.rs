//! Persistent, ordered command log for a Raft node.
//!
//! The crate stores replicated commands durably, tracks the commit and apply
//! progress, and applies committed commands to a pluggable state machine
//! exactly once, in index order. Elections, terms and RPCs belong to the
//! consensus core that drives it.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use raft_log::{LoggingStateMachine, RaftLog, RaftLogOptions};
//!
//! let log = RaftLog::open(RaftLogOptions::with_base_dir("./data"), Arc::new(LoggingStateMachine))?;
//! let index = log.append_entry(1, "set x 1").await?;
//! log.set_commit_index(index).await?;
//! log.apply_entries().await?;
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod raft_log;
pub mod state_machine;
pub mod storage;
pub mod traits;

pub type Command = String;

pub use config::RaftLogOptions;
pub use error::{ApplyError, ConfigError, LogError, StorageError, ValidationError};
pub use message::{Entry, EntryInfo, LogEntry};
pub use raft_log::{ApplyState, RaftLog};
pub use state_machine::LoggingStateMachine;
pub use traits::{LogEntryStorage, LogResult, MetaStorage, StateMachine, StorageResult};
