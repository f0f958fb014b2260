//! State machine abstraction.
//!
//! The state machine is the application logic the replicated log drives.
//! When log entries commit, their payloads are applied in log order.
//! Commands are opaque bytes at this layer.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Result of applying a command: output bytes on success, a message when
/// the command itself is rejected (the rejection is replicated state too).
pub type ApplyResult = Result<Bytes, String>;

/// The application logic the log drives.
///
/// Implementations must be deterministic: applying the same commands in
/// the same order must produce the same state on every node.
pub trait StateMachine: Send {
    /// Apply a committed command.
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// State machine that supports log compaction: its full state can be
/// captured as bytes and restored from them.
pub trait Snapshotable: StateMachine {
    /// Capture the current state.
    fn snapshot(&self) -> Result<Bytes, String>;

    /// Replace the current state with a captured one.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for testing.
pub type AppliedCommands = Arc<Mutex<Vec<Bytes>>>;

/// Test state machine that records every applied command.
#[derive(Default)]
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a shared vec to inspect applied commands from outside.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied.lock().push(Bytes::copy_from_slice(command));
        Ok(Bytes::new())
    }
}

impl Snapshotable for TestStateMachine {
    fn snapshot(&self) -> Result<Bytes, String> {
        let applied: Vec<Vec<u8>> = self.applied.lock().iter().map(|b| b.to_vec()).collect();
        serde_json::to_vec(&applied)
            .map(Bytes::from)
            .map_err(|e| format!("test state machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<Vec<u8>> = serde_json::from_slice(data)
            .map_err(|e| format!("test state machine restore failed: {}", e))?;
        *self.applied.lock() = applied.into_iter().map(Bytes::from).collect();
        Ok(())
    }
}
