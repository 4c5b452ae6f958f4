use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use raft_log::{ApplyError, Entry, StateMachine};
use tracing::debug;

/// Records every applied entry. Can be told to fail on one index to stand in
/// for a crash part way through a batch.
#[derive(Clone, Default)]
pub struct TestStateMachine {
    applied: Arc<Mutex<Vec<(u64, u64, String)>>>,
    fail_at: Arc<Mutex<Option<u64>>>,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, index: Option<u64>) {
        *self.fail_at.lock() = index;
    }

    pub fn applied_indices(&self) -> Vec<u64> {
        self.applied.lock().iter().map(|(index, _, _)| *index).collect()
    }

    pub fn applied_commands(&self) -> Vec<String> {
        self.applied.lock().iter().map(|(_, _, cmd)| cmd.clone()).collect()
    }
}

#[async_trait]
impl StateMachine for TestStateMachine {
    async fn apply_command(&self, entry: &Entry) -> Result<(), ApplyError> {
        if *self.fail_at.lock() == Some(entry.index) {
            return Err(ApplyError::Internal(format!("crash at {}", entry.index)));
        }
        debug!("apply index={} term={}", entry.index, entry.term);
        self.applied
            .lock()
            .push((entry.index, entry.term, entry.command.clone()));
        Ok(())
    }
}
