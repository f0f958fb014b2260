//! Framed TCP transport using the wire codec.
//!
//! One connection per request keeps correlation trivial: the client
//! writes a request frame and reads exactly one response frame. The
//! server side accepts connections and dispatches each inbound message
//! into the node's RPC handler.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use super::codec::{read_message, write_message};
use super::{Transport, TransportError};
use crate::core::message::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, Message,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::raft_server::RpcHandler;

/// TCP transport resolving peer ids to addresses.
pub struct TcpTransport {
    addresses: HashMap<u64, String>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(addresses: HashMap<u64, String>) -> Self {
        Self { addresses, timeout: Duration::from_secs(1) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn roundtrip(&self, target: u64, request: Message) -> Result<Message, TransportError> {
        let address = self.addresses.get(&target).ok_or(TransportError::NodeNotFound)?;
        let exchange = async {
            let mut stream = TcpStream::connect(address)
                .await
                .map_err(|_| TransportError::ConnectionFailed)?;
            write_message(&mut stream, &request).await?;
            read_message(&mut stream)
                .await?
                .ok_or(TransportError::ConnectionFailed)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

fn unexpected(message: Message) -> TransportError {
    TransportError::Protocol(format!("unexpected response kind {}", message.kind()))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        match self.roundtrip(target, Message::RequestVote(args)).await? {
            Message::RequestVoteResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        match self.roundtrip(target, Message::AppendEntries(args)).await? {
            Message::AppendEntriesResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        match self.roundtrip(target, Message::InstallSnapshot(args)).await? {
            Message::InstallSnapshotResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn timeout_now(
        &self,
        target: u64,
        args: TimeoutNowArgs,
    ) -> Result<TimeoutNowResult, TransportError> {
        match self.roundtrip(target, Message::TimeoutNow(args)).await? {
            Message::TimeoutNowResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }
}

/// Accept loop: serve inbound RPCs from `listener` into `handler` until
/// the task is dropped.
pub async fn serve(listener: TcpListener, handler: RpcHandler<TcpTransport>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "accept failed");
                continue;
            }
        };
        trace!(%peer, "inbound connection");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                trace!(error = %e, "connection closed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: RpcHandler<TcpTransport>,
) -> Result<(), TransportError> {
    while let Some(message) = read_message(&mut stream).await? {
        let response = match message {
            Message::RequestVote(args) => {
                Message::RequestVoteResult(handler.request_vote(args).await)
            }
            Message::AppendEntries(args) => {
                Message::AppendEntriesResult(handler.append_entries(args).await)
            }
            Message::InstallSnapshot(args) => {
                Message::InstallSnapshotResult(handler.install_snapshot(args).await)
            }
            Message::TimeoutNow(args) => {
                Message::TimeoutNowResult(handler.timeout_now(args).await)
            }
            other => return Err(unexpected(other)),
        };
        write_message(&mut stream, &response).await?;
    }
    Ok(())
}
