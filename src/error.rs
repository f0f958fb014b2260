//! Public error taxonomy.

use thiserror::Error;

use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors surfaced to library consumers.
///
/// Protocol-internal conditions (stale terms, log-matching conflicts) are
/// handled inside the state machine and never reach this type.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is a follower with no known leader.
    #[error("no leader is currently known")]
    NoLeader,

    /// This node is not the leader (includes a leader hint if known).
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    /// The node is closing or closed.
    #[error("node is shutting down")]
    Shutdown,

    /// A configuration change is already in progress.
    #[error("a configuration change is already in progress")]
    Busy,

    /// An in-flight request was terminated by shutdown or loss of leadership.
    #[error("request cancelled")]
    Cancelled,

    /// A bounded operation (promotion catch-up, leadership transfer) ran
    /// out of allotted rounds or time.
    #[error("operation timed out")]
    Timeout,

    /// The requested configuration change is malformed.
    #[error("invalid configuration change: {0}")]
    InvalidChange(String),

    /// The user state machine rejected a command.
    #[error("state machine error: {0}")]
    StateMachine(String),

    /// Disk failure; the node latches into an unavailable state.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Outbound RPC failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
