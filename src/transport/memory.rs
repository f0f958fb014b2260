//! In-memory transport implementation for testing.
//!
//! Typed messages move over channels; each node runs one dispatcher task
//! feeding its inbound queue into the RPC handler, which serializes all
//! message intake for that node.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Transport, TransportError};
use crate::core::message::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::raft_server::RpcHandler;

/// Request types that can be sent to a node.
pub enum Request {
    RequestVote { args: RequestVoteArgs, reply: oneshot::Sender<RequestVoteResult> },
    AppendEntries { args: AppendEntriesArgs, reply: oneshot::Sender<AppendEntriesResult> },
    InstallSnapshot { args: InstallSnapshotArgs, reply: oneshot::Sender<InstallSnapshotResult> },
    TimeoutNow { args: TimeoutNowArgs, reply: oneshot::Sender<TimeoutNowResult> },
}

/// In-memory transport that uses channels for communication.
pub struct InMemoryTransport {
    /// Senders to each node's request channel.
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls.
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self { senders, timeout: None }
    }

    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self { senders, timeout: Some(timeout) }
    }

    async fn roundtrip<R>(
        &self,
        target: u64,
        request: Request,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;
        sender.send(request).await.map_err(|_| TransportError::ConnectionFailed)?;
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(target, Request::RequestVote { args, reply }, rx).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(target, Request::AppendEntries { args, reply }, rx).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(target, Request::InstallSnapshot { args, reply }, rx).await
    }

    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(target, Request::TimeoutNow { args, reply }, rx).await
    }
}

/// Inbound side of one node: a queue of requests to dispatch.
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Serve requests into the node's RPC handler until every transport
    /// referencing this node is dropped. Requests are processed one at a
    /// time, so per-peer acknowledgement order is preserved.
    pub async fn serve(mut self, handler: RpcHandler<InMemoryTransport>) {
        while let Some(request) = self.receiver.recv().await {
            match request {
                Request::RequestVote { args, reply } => {
                    let _ = reply.send(handler.request_vote(args).await);
                }
                Request::AppendEntries { args, reply } => {
                    let _ = reply.send(handler.append_entries(args).await);
                }
                Request::InstallSnapshot { args, reply } => {
                    let _ = reply.send(handler.install_snapshot(args).await);
                }
                Request::TimeoutNow { args, reply } => {
                    let _ = reply.send(handler.timeout_now(args).await);
                }
            }
        }
    }
}

/// Create transports and inbound handles for a cluster of nodes.
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Same as [`create_cluster`] with an RPC timeout on every transport.
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders = HashMap::new();
    let mut handles = HashMap::new();
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(256);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }
    let transports = node_ids
        .iter()
        .map(|&id| {
            let transport = match timeout {
                Some(t) => InMemoryTransport::with_timeout(senders.clone(), t),
                None => InMemoryTransport::new(senders.clone()),
            };
            (id, transport)
        })
        .collect();
    (transports, handles)
}
