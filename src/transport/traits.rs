//! Transport abstraction for Raft RPC communication.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::message::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection to the target node failed.
    #[error("connection to peer failed")]
    ConnectionFailed,
    /// Request timed out.
    #[error("request timed out")]
    Timeout,
    /// Target node not found.
    #[error("peer not found")]
    NodeNotFound,
    /// The peer answered with something the codec could not accept.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Request/response transport between nodes, keyed by server id. The core
/// only promises to hand typed messages in and out; the wire format is the
/// transport's business.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote (or pre-vote probe) to a peer.
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer.
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send one InstallSnapshot chunk to a peer.
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;

    /// Ask a peer to start an election immediately (leadership transfer).
    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError>;
}
