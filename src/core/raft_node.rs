//! Async node layer: drives the consensus core over a transport.
//!
//! Every outbound exchange follows the same shape: snapshot the requests
//! to send under a short core lock, fan out over the transport without
//! holding it, then feed each response back into the core as it arrives.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::message::{RequestVoteArgs, TimeoutNowArgs};
use super::raft_core::{PeerMessage, RaftCore, Role};
use crate::transport::Transport;

/// Shared reference to the consensus core. RPC intake and the node's own
/// event loop both serialize through this mutex, which is what confines
/// all state mutation to one logical reactor.
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level Raft node that handles consensus traffic.
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: Arc<T>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        RaftNode { core: self.core.clone(), transport: self.transport.clone() }
    }
}

impl<T: Transport + 'static> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self { core: Arc::new(Mutex::new(core)), transport: Arc::new(transport) }
    }

    /// Shared reference to the core (for incoming RPC handling).
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    pub async fn role(&self) -> Role {
        self.core.lock().await.role
    }

    /// Run the election flow: pre-vote probe first, then a real election
    /// once a quorum says we could win. Returns true if this node became
    /// leader.
    pub async fn run_election(&self) -> bool {
        let (args, peers, already_quorate) = {
            let mut core = self.core.lock().await;
            if !core.can_campaign() {
                return false;
            }
            let args = core.pre_vote_args();
            (args, core.voter_peers(), core.has_pre_vote_quorum())
        };

        if !already_quorate && !self.collect_pre_votes(args, peers).await {
            debug!("pre-vote did not reach a quorum");
            return false;
        }

        let (args, peers) = {
            let mut core = self.core.lock().await;
            if core.is_leader() {
                return true;
            }
            let args = match core.start_election().await {
                Ok(args) => args,
                Err(e) => {
                    warn!(error = %e, "could not start election");
                    return false;
                }
            };
            if core.is_leader() {
                return true;
            }
            (args, core.voter_peers())
        };
        self.solicit_votes(args, peers).await
    }

    async fn collect_pre_votes(&self, args: RequestVoteArgs, peers: Vec<u64>) -> bool {
        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    match core.handle_pre_vote_result(peer_id, &result).await {
                        Ok(true) => return true,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(error = %e, "pre-vote processing failed");
                            return false;
                        }
                    }
                }
                Err(e) => trace!(peer = peer_id, error = %e, "pre-vote request failed"),
            }
        }
        false
    }

    /// Broadcast vote requests and collect results until a quorum or the
    /// peer list is exhausted. Returns true if this node became leader.
    pub async fn solicit_votes(&self, args: RequestVoteArgs, peers: Vec<u64>) -> bool {
        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    match core.handle_request_vote_result(peer_id, &result).await {
                        Ok(true) => return true, // quorum; don't wait for stragglers
                        Ok(false) => {
                            if core.role != Role::Candidate {
                                return false;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "vote processing failed");
                            return false;
                        }
                    }
                }
                Err(e) => trace!(peer = peer_id, error = %e, "vote request failed"),
            }
        }
        false
    }

    /// One replication turn: send each peer what it needs next (entries,
    /// a heartbeat, or a snapshot chunk) and feed the responses back.
    /// Also emits the TimeoutNow for a pending leadership transfer.
    pub async fn broadcast_append(&self) {
        enum Outcome {
            Append(crate::core::message::AppendEntriesResult, Option<u64>),
            AppendFailed(Option<u64>),
            Snapshot(crate::core::message::InstallSnapshotResult, u64),
            SnapshotFailed,
        }

        let (requests, timeout_now) = {
            let mut core = self.core.lock().await;
            if !core.is_leader() {
                return;
            }
            let timeout_now = core.take_timeout_now();
            let mut requests = Vec::new();
            for peer_id in core.replication_targets() {
                if let Some(message) = core.prepare_peer_message(peer_id) {
                    requests.push((peer_id, message));
                }
            }
            (requests, timeout_now)
        };

        if let Some((target, args)) = timeout_now {
            self.send_timeout_now(target, args).await;
        }

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, message)| {
                let transport = &self.transport;
                async move {
                    match message {
                        PeerMessage::Append { args, pin } => {
                            match transport.append_entries(peer_id, args).await {
                                Ok(result) => (peer_id, Outcome::Append(result, pin)),
                                Err(e) => {
                                    trace!(peer = peer_id, error = %e, "append failed");
                                    (peer_id, Outcome::AppendFailed(pin))
                                }
                            }
                        }
                        PeerMessage::Snapshot { args } => {
                            let acked_end = args.offset + args.data.len() as u64;
                            match transport.install_snapshot(peer_id, args).await {
                                Ok(result) => (peer_id, Outcome::Snapshot(result, acked_end)),
                                Err(e) => {
                                    trace!(peer = peer_id, error = %e, "snapshot chunk failed");
                                    (peer_id, Outcome::SnapshotFailed)
                                }
                            }
                        }
                    }
                }
            })
            .collect();

        while let Some((peer_id, outcome)) = futures.next().await {
            let mut core = self.core.lock().await;
            match outcome {
                Outcome::Append(result, pin) => {
                    core.finish_peer_append(peer_id, pin, true);
                    if let Err(e) = core.handle_append_entries_result(peer_id, &result).await {
                        warn!(peer = peer_id, error = %e, "append result processing failed");
                    }
                }
                Outcome::AppendFailed(pin) => core.finish_peer_append(peer_id, pin, false),
                Outcome::Snapshot(result, acked_end) => {
                    if let Err(e) =
                        core.handle_install_snapshot_result(peer_id, acked_end, &result).await
                    {
                        warn!(peer = peer_id, error = %e, "snapshot result processing failed");
                    }
                }
                Outcome::SnapshotFailed => {}
            }
        }
    }

    /// Deliver a TimeoutNow to the leadership-transfer target.
    pub async fn send_timeout_now(&self, target: u64, args: TimeoutNowArgs) {
        match self.transport.timeout_now(target, args).await {
            Ok(result) => {
                if result.term > self.core.lock().await.current_term {
                    // The target already moved on; nothing to do, the next
                    // message from it will step us down.
                    trace!(target, term = result.term, "transfer target is ahead");
                }
            }
            Err(e) => trace!(target, error = %e, "timeout-now failed"),
        }
    }
}
