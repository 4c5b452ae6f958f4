use async_trait::async_trait;
use tracing::info;

use crate::message::Entry;
use crate::traits::{ApplyResult, StateMachine};

/// State machine that only reports what it is given.
///
/// Useful while bringing up a node before a real state machine is wired in,
/// and as the hook of the command line tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStateMachine;

#[async_trait]
impl StateMachine for LoggingStateMachine {
    async fn apply_command(&self, entry: &Entry) -> ApplyResult<()> {
        info!(
            "[apply] index={} term={} command={}",
            entry.index, entry.term, entry.command
        );
        Ok(())
    }
}
