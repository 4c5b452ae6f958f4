pub mod test_statemachine;

use std::sync::Arc;

use raft_log::{RaftLog, RaftLogOptions, StateMachine};
use tempfile::TempDir;

pub fn open_log(dir: &TempDir, state_machine: Arc<dyn StateMachine>) -> RaftLog {
    RaftLog::open(RaftLogOptions::with_base_dir(dir.path()), state_machine).unwrap()
}
