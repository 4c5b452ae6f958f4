use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::storage::{LogEntryStoreOptions, MetaStoreOptions};

const LOG_FILE_NAME: &str = "raft_log.seg";
const META_FILE_NAME: &str = "raft_meta.seg";

/// Configuration options for a [`crate::RaftLog`].
///
/// Files created under `base_dir`:
/// - `raft_log.seg` for log entries
/// - `raft_meta.seg` for `commit_index` / `last_applied`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftLogOptions {
    /// Directory holding the log and metadata files
    #[serde(alias = "db_path")]
    pub base_dir: PathBuf,

    /// Whether to sync data to disk after each write
    pub sync_on_write: bool,

    /// Maximum number of queued log operations written per round
    pub batch_size: usize,

    /// Cache size for recent log entries
    pub cache_entries_size: usize,

    /// Maximum number of concurrent blocking reads
    pub max_io_threads: usize,

    /// Metadata frames kept before the metadata file is compacted
    pub meta_compact_threshold: usize,

    /// Number of entries fetched per page while applying
    pub apply_batch_size: usize,
}

impl Default for RaftLogOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            sync_on_write: true,
            batch_size: 100,
            cache_entries_size: 1000,
            max_io_threads: 4,
            meta_compact_threshold: 4096,
            apply_batch_size: 256,
        }
    }
}

impl RaftLogOptions {
    /// Create options with a custom base directory.
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            warn!("Failed to read config file {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_json::from_str(&content).map_err(|source| {
            warn!("Failed to parse config file {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join(LOG_FILE_NAME)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.base_dir.join(META_FILE_NAME)
    }

    pub fn log_store_options(&self) -> LogEntryStoreOptions {
        LogEntryStoreOptions {
            path: self.log_path(),
            sync_on_write: self.sync_on_write,
            batch_size: self.batch_size,
            cache_entries_size: self.cache_entries_size,
            max_io_threads: self.max_io_threads,
        }
    }

    pub fn meta_store_options(&self) -> MetaStoreOptions {
        MetaStoreOptions {
            path: self.meta_path(),
            sync_on_write: self.sync_on_write,
            compact_threshold: self.meta_compact_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_db_path_alias_and_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("raft.json");
        std::fs::write(&path, r#"{ "db_path": "/var/lib/raft" }"#).unwrap();

        let options = RaftLogOptions::from_json_file(&path).unwrap();
        assert_eq!(options.base_dir, PathBuf::from("/var/lib/raft"));
        assert_eq!(options.log_path(), PathBuf::from("/var/lib/raft/raft_log.seg"));
        assert_eq!(
            RaftLogOptions {
                base_dir: PathBuf::from("./data"),
                ..options
            },
            RaftLogOptions::default()
        );
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("raft.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            RaftLogOptions::from_json_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            RaftLogOptions::from_json_file(temp_dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
