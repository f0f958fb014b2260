//! RaftServer: the per-node event loop and the embedder-facing surface.
//!
//! One tokio select loop per node drives the coarse timers (heartbeat,
//! election deadline), client commands and shutdown. RPC intake arrives
//! through [`RpcHandler`] and serializes on the same shared core, so every
//! state mutation happens in one logical reactor turn.

use std::pin::pin;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::membership::Membership;
use super::message::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use super::raft_core::{ChangeRequest, RaftCore, Role};
use super::raft_node::{RaftNode, SharedCore};
use super::watch::Watcher;
use crate::error::RaftError;
use crate::transport::Transport;

/// Point-in-time view of a node, for introspection and tests.
#[derive(Debug, Clone)]
pub struct Status {
    pub id: u64,
    pub term: u64,
    pub role: Role,
    pub leader_hint: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub membership: Membership,
}

/// Commands sent to the server loop from [`RaftHandle`].
enum Command {
    Submit { payload: Bytes, reply: oneshot::Sender<Result<Bytes, RaftError>> },
    ChangeMembership { change: ChangeRequest, reply: oneshot::Sender<Result<(), RaftError>> },
    TransferLeadership { target: Option<u64>, reply: oneshot::Sender<Result<(), RaftError>> },
    TakeSnapshot { reply: oneshot::Sender<Result<(), RaftError>> },
    RegisterWatcher { watcher: Box<dyn Watcher>, reply: oneshot::Sender<Result<(), RaftError>> },
    Status { reply: oneshot::Sender<Status> },
}

/// Handle for interacting with a running [`RaftServer`].
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    async fn send(&self, command: Command) -> Result<(), RaftError> {
        self.command_tx.send(command).await.map_err(|_| RaftError::Shutdown)
    }

    /// Submit a command for replication. Resolves with the state machine
    /// output once the entry is committed and applied on this node.
    pub async fn submit(&self, payload: Bytes) -> Result<Bytes, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { payload, reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Add a server to the cluster as a non-voter.
    pub async fn add_server(&self, id: u64, address: String) -> Result<(), RaftError> {
        self.change(ChangeRequest::Add { id, address }).await
    }

    /// Promote a non-voter (or spare) to voter, catching it up first.
    pub async fn promote_server(&self, id: u64) -> Result<(), RaftError> {
        self.change(ChangeRequest::Promote { id }).await
    }

    /// Remove a server from the cluster.
    pub async fn remove_server(&self, id: u64) -> Result<(), RaftError> {
        self.change(ChangeRequest::Remove { id }).await
    }

    async fn change(&self, change: ChangeRequest) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ChangeMembership { change, reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Hand leadership to `target` (or the most caught-up voter).
    pub async fn transfer_leadership(&self, target: Option<u64>) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TransferLeadership { target, reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Trigger a snapshot of the state machine right now.
    pub async fn take_snapshot(&self) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TakeSnapshot { reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Register an observer for leader/term/availability transitions.
    pub async fn register_watcher(&self, watcher: Box<dyn Watcher>) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterWatcher { watcher, reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Current view of the node.
    pub async fn status(&self) -> Result<Status, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Shut the node down cooperatively: in-flight disk writes drain,
    /// pending client operations resolve with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Raft server that owns the event loop for one node.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    config: RaftConfig,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Wrap a core and a transport. Returns the server plus the RPC
    /// handler the transport layer dispatches inbound messages into.
    pub fn new(core: RaftCore, transport: T) -> (Self, RpcHandler<T>) {
        let config = core.config.clone();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let handler = RpcHandler { node: node.clone() };
        let server =
            Self { node, config, command_rx, command_tx, shutdown_rx, shutdown_tx };
        (server, handler)
    }

    /// Persist the initial single-voter configuration. Only for the first
    /// node of a fresh cluster, before [`RaftServer::start`].
    pub async fn bootstrap(&self, address: String) -> Result<(), RaftError> {
        self.node.shared_core().lock().await.bootstrap(address).await
    }

    /// Start the event loop and return the interaction handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay keeps missed ticks from starving the election branch.
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut election_timeout = self.config.random_election_timeout();

        loop {
            let deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(deadline));
            let role = self.node.role().await;

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }

                _ = heartbeat.tick() => {
                    let core = self.node.shared_core();
                    let mut core = core.lock().await;
                    if let Err(e) = core.tick().await {
                        warn!(error = %e, "tick failed");
                    }
                    if core.is_leader() {
                        // The leader's own timer never fires elections.
                        core.last_contact = Instant::now();
                        drop(core);
                        let node = self.node.clone();
                        tokio::spawn(async move { node.broadcast_append().await });
                    }
                }

                _ = election_sleep, if role != Role::Leader => {
                    if self.election_timed_out(election_timeout).await {
                        debug!(timeout_ms = election_timeout.as_millis() as u64, "election timeout");
                        if self.node.run_election().await {
                            // Establish leadership right away.
                            self.node.broadcast_append().await;
                        }
                    }
                    election_timeout = self.config.random_election_timeout();
                }

                else => break,
            }
        }

        info!("server loop exiting, draining storage");
        self.node.shared_core().lock().await.shutdown().await;
    }

    async fn election_deadline(&self, timeout: Duration) -> Instant {
        self.node.shared_core().lock().await.last_contact + timeout
    }

    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let core = self.node.shared_core();
        let last_contact = core.lock().await.last_contact;
        Instant::now() >= last_contact + timeout
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::Submit { payload, reply } => {
                let submitted = {
                    let core = self.node.shared_core();
                    let mut core = core.lock().await;
                    core.submit(payload).await
                };
                match submitted {
                    Ok((_index, rx)) => {
                        // Resolve the caller when the entry applies; push
                        // replication instead of waiting for the heartbeat.
                        tokio::spawn(async move {
                            let result =
                                rx.await.unwrap_or(Err(RaftError::Shutdown));
                            let _ = reply.send(result);
                        });
                        let node = self.node.clone();
                        tokio::spawn(async move { node.broadcast_append().await });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::ChangeMembership { change, reply } => {
                let changed = {
                    let core = self.node.shared_core();
                    let mut core = core.lock().await;
                    core.change_membership(change).await
                };
                match changed {
                    Ok(rx) => {
                        tokio::spawn(async move {
                            let result = rx
                                .await
                                .unwrap_or(Err(RaftError::Shutdown))
                                .map(|_| ());
                            let _ = reply.send(result);
                        });
                        let node = self.node.clone();
                        tokio::spawn(async move { node.broadcast_append().await });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::TransferLeadership { target, reply } => {
                let core = self.node.shared_core();
                let transfer = core.lock().await.transfer_leadership(target);
                match transfer {
                    Ok(rx) => {
                        tokio::spawn(async move {
                            let result = rx
                                .await
                                .unwrap_or(Err(RaftError::Shutdown))
                                .map(|_| ());
                            let _ = reply.send(result);
                        });
                        // The TimeoutNow rides on the next replication turn.
                        let node = self.node.clone();
                        tokio::spawn(async move { node.broadcast_append().await });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::TakeSnapshot { reply } => {
                let core = self.node.shared_core();
                let result = core.lock().await.take_snapshot().await;
                let _ = reply.send(result);
            }
            Command::RegisterWatcher { watcher, reply } => {
                let core = self.node.shared_core();
                let result = core.lock().await.watchers.register(watcher);
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let core = self.node.shared_core();
                let core = core.lock().await;
                let _ = reply.send(Status {
                    id: core.id,
                    term: core.current_term,
                    role: core.role,
                    leader_hint: core.leader_hint,
                    commit_index: core.commit_index,
                    last_applied: core.last_applied,
                    last_log_index: core.last_log_index(),
                    membership: core.membership.clone(),
                });
            }
        }
    }
}

/// Inbound RPC dispatch. Transports hand received messages to these
/// methods; replies come back only after the core has persisted whatever
/// the reply depends on.
pub struct RpcHandler<T: Transport> {
    node: RaftNode<T>,
}

impl<T: Transport> Clone for RpcHandler<T> {
    fn clone(&self) -> Self {
        RpcHandler { node: self.node.clone() }
    }
}

impl<T: Transport + 'static> RpcHandler<T> {
    pub fn shared_core(&self) -> SharedCore {
        self.node.shared_core()
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteResult {
        let core = self.node.shared_core();
        let mut core = core.lock().await;
        match core.handle_request_vote(&args).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "request-vote handling failed");
                RequestVoteResult {
                    term: core.current_term,
                    vote_granted: false,
                    pre_vote: args.pre_vote,
                }
            }
        }
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesResult {
        let core = self.node.shared_core();
        let mut core = core.lock().await;
        match core.handle_append_entries(&args).await {
            Ok(output) => output.result,
            Err(e) => {
                warn!(error = %e, "append-entries handling failed");
                AppendEntriesResult {
                    term: core.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: 0,
                    conflict_term: 0,
                }
            }
        }
    }

    pub async fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotResult {
        let core = self.node.shared_core();
        let mut core = core.lock().await;
        match core.handle_install_snapshot(&args).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "install-snapshot handling failed");
                InstallSnapshotResult::Failed { term: core.current_term, reason: e.to_string() }
            }
        }
    }

    pub async fn timeout_now(&self, args: TimeoutNowArgs) -> TimeoutNowResult {
        let outcome = {
            let core = self.node.shared_core();
            let mut core = core.lock().await;
            core.handle_timeout_now(&args).await
        };
        match outcome {
            Ok((result, Some(vote_args))) => {
                // Solicit votes off the RPC path; the reply goes out now.
                let node = self.node.clone();
                tokio::spawn(async move {
                    let peers = node.shared_core().lock().await.voter_peers();
                    if node.solicit_votes(vote_args, peers).await {
                        node.broadcast_append().await;
                    }
                });
                result
            }
            Ok((result, None)) => result,
            Err(e) => {
                warn!(error = %e, "timeout-now handling failed");
                TimeoutNowResult { term: 0 }
            }
        }
    }
}
