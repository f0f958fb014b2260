//! Raft consensus core.
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro
//! and John Ousterhout, with pre-vote, conflict-hint backtracking and
//! single-server membership changes.
//!
//! The core is transport-agnostic: RPC handlers take typed messages and
//! return typed results. Every handler persists what it must (term, vote,
//! entries) before its result is handed back, so replies are only ever
//! emitted after the corresponding disk completion.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::RaftConfig;
use crate::core::log::{Entry, EntryKind, LogStore};
use crate::core::membership::{Membership, Server, ServerRole};
use crate::core::message::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult, TimeoutNowArgs, TimeoutNowResult,
};
use crate::core::progress::{CatchUp, Progress, SnapshotTransfer};
use crate::core::snapshot::{PendingInstall, Snapshot, SnapshotMeta};
use crate::core::watch::{WatchEvent, WatchList};
use crate::error::RaftError;
use crate::state_machine::Snapshotable;
use crate::storage::{Storage, StorageError};

/// Raft node roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive state, receives updates from the leader.
    Follower,
    /// Actively seeking votes to become leader.
    Candidate,
    /// Handles all client requests and replicates the log.
    Leader,
}

/// Completion continuation for a client operation.
pub type Completion = oneshot::Sender<Result<Bytes, RaftError>>;

/// A requested single-server membership change.
#[derive(Debug, Clone)]
pub enum ChangeRequest {
    /// Add a server as a non-voter.
    Add { id: u64, address: String },
    /// Promote a non-voter or spare to voter (runs catch-up rounds first).
    Promote { id: u64 },
    /// Remove a server.
    Remove { id: u64 },
}

/// One outbound message towards a peer, prepared by the leader.
#[derive(Debug)]
pub enum PeerMessage {
    /// AppendEntries batch; `pin` guards the carried entries against
    /// compaction until the response is processed.
    Append { args: AppendEntriesArgs, pin: Option<u64> },
    /// Next chunk of an InstallSnapshot transfer.
    Snapshot { args: InstallSnapshotArgs },
}

/// Result of handling an AppendEntries RPC.
#[derive(Debug)]
pub struct HandleAppendEntriesOutput {
    /// The response to send back to the leader.
    pub result: AppendEntriesResult,
    /// Leader ID if we recognized a valid leader.
    pub leader_id: Option<u64>,
}

/// Core Raft state machine (transport-agnostic).
pub struct RaftCore {
    storage: Box<dyn Storage>,
    fsm: Box<dyn Snapshotable>,
    pub(crate) config: RaftConfig,

    /// Unique identifier for this node.
    pub id: u64,

    // Persistent state, cached in memory and always written through storage
    // before any dependent reply leaves the node.
    /// Latest term this server has seen.
    pub current_term: u64,
    /// Candidate that received this server's vote in the current term.
    pub voted_for: Option<u64>,
    /// In-memory window over the durable log.
    pub log: LogStore,
    /// Last log index covered by the current snapshot (0 if none).
    pub snapshot_last_index: u64,
    /// Term of the last snapshot-covered entry.
    pub snapshot_last_term: u64,

    /// Configuration in force. Takes effect at append time and rolls back
    /// if its entry is truncated.
    pub membership: Membership,
    /// Log index of the entry that set `membership` (0 = bootstrap state).
    pub membership_index: u64,
    /// Last committed configuration, the rollback target.
    committed_membership: (Membership, u64),

    // Volatile state on all servers.
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: Role,
    /// Current known leader, if any.
    pub leader_hint: Option<u64>,
    /// Last valid contact from a leader (or other election-timer reset).
    pub last_contact: Instant,

    // Candidate state.
    votes: Vec<u64>,
    prevotes: Vec<u64>,

    // Leader state, reset on every election.
    pub(crate) progress: HashMap<u64, Progress>,
    catch_up: Option<CatchUp>,
    catch_up_reply: Option<Completion>,
    transfer_target: Option<(u64, Instant)>,
    transfer_reply: Option<Completion>,

    /// Follower-side chunked snapshot install in progress.
    pending_install: Option<PendingInstall>,

    /// Client completions waiting for commit + apply, keyed by log index.
    pending: HashMap<u64, Completion>,
    /// The uncommitted configuration change's completion, if any.
    pending_change: Option<(u64, Completion)>,

    pub(crate) watchers: WatchList,
    /// Latched on disk failure; the node stops making protocol progress.
    pub unavailable: bool,
}

impl RaftCore {
    /// Create a core from loaded storage, restoring the state machine from
    /// the latest snapshot and the configuration from the log.
    pub fn new(
        id: u64,
        config: RaftConfig,
        mut storage: Box<dyn Storage>,
        mut fsm: Box<dyn Snapshotable>,
    ) -> Result<Self, RaftError> {
        let state = storage.load()?;

        let (snapshot_last_index, snapshot_last_term, snapshot_membership) = match &state.snapshot
        {
            Some(snapshot) => {
                fsm.restore(&snapshot.data).map_err(RaftError::StateMachine)?;
                (
                    snapshot.meta.last_included_index,
                    snapshot.meta.last_included_term,
                    (snapshot.meta.membership.clone(), snapshot.meta.membership_index),
                )
            }
            None => (0, 0, (Membership::new(), 0)),
        };

        let offset = state.first_index - 1;
        let offset_term = if offset == snapshot_last_index { snapshot_last_term } else { 0 };
        let log = LogStore::restore(offset, offset_term, state.entries);

        // Configuration takes effect at append time: the newest entry in
        // the log wins, falling back to the snapshot's.
        let mut membership = snapshot_membership.0.clone();
        let mut membership_index = snapshot_membership.1;
        for index in log.first_index()..=log.last_index() {
            if let Some(entry) = log.get(index) {
                if entry.kind == EntryKind::Configuration {
                    membership = Membership::decode(&entry.payload)?;
                    membership_index = index;
                }
            }
        }

        Ok(RaftCore {
            storage,
            fsm,
            config,
            id,
            current_term: state.term,
            voted_for: state.voted_for,
            log,
            snapshot_last_index,
            snapshot_last_term,
            membership,
            membership_index,
            committed_membership: snapshot_membership,
            commit_index: snapshot_last_index,
            last_applied: snapshot_last_index,
            role: Role::Follower,
            leader_hint: None,
            last_contact: Instant::now(),
            votes: Vec::new(),
            prevotes: Vec::new(),
            progress: HashMap::new(),
            catch_up: None,
            catch_up_reply: None,
            transfer_target: None,
            transfer_reply: None,
            pending_install: None,
            pending: HashMap::new(),
            pending_change: None,
            watchers: WatchList::new(),
            unavailable: false,
        })
    }

    /// Persist the initial single-voter configuration at index 1. Only the
    /// first node of a cluster is bootstrapped; the rest join via
    /// membership changes.
    pub async fn bootstrap(&mut self, address: String) -> Result<(), RaftError> {
        if self.log.last_index() != 0 || self.snapshot_last_index != 0 || self.current_term != 0 {
            return Err(RaftError::InvalidChange(
                "bootstrap requires a pristine node".into(),
            ));
        }
        let membership = Membership::bootstrap(self.id, address);
        let entry = Entry::configuration(0, 1, membership.encode());
        self.persist_append(vec![entry]).await?;
        info!(id = self.id, "bootstrapped cluster configuration");
        Ok(())
    }

    // === Small accessors ===

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        if self.log.is_empty() {
            self.snapshot_last_term
        } else {
            self.log.last_term()
        }
    }

    /// Term of the entry at `index`, answering from the snapshot boundary
    /// when the entry itself is compacted away.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.log.term_of(index)
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Quorum follows the configuration in force (append-time rule).
    fn quorum(&self) -> usize {
        self.membership.quorum()
    }

    // === Persistence helpers ===

    fn latch(&mut self, e: StorageError) -> RaftError {
        if matches!(e, StorageError::Io(_)) && !self.unavailable {
            self.unavailable = true;
            warn!(id = self.id, error = %e, "storage failure, node is now unavailable");
            self.watchers.fire(&WatchEvent::Unavailable);
        }
        RaftError::Storage(e)
    }

    /// Update `current_term` and `voted_for` together and persist them.
    async fn persist_term_vote(
        &mut self,
        term: u64,
        voted_for: Option<u64>,
    ) -> Result<(), RaftError> {
        let term_changed = term != self.current_term;
        self.current_term = term;
        self.voted_for = voted_for;
        match self.storage.save_vote(term, voted_for).await {
            Ok(()) => {
                if term_changed {
                    self.watchers.fire(&WatchEvent::TermChange { term });
                }
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Durably append entries, then make them visible in the window.
    /// Configuration entries take effect here, at append time.
    async fn persist_append(&mut self, entries: Vec<Entry>) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.storage.append(&entries).await {
            return Err(self.latch(e));
        }
        for entry in &entries {
            if entry.kind == EntryKind::Configuration {
                self.membership = Membership::decode(&entry.payload)?;
                self.membership_index = entry.index;
                debug!(id = self.id, index = entry.index, "configuration in force");
            }
        }
        self.log.append(entries);
        Ok(())
    }

    /// Durably drop the suffix from `from_index`, rolling back the
    /// configuration if its entry was truncated away.
    async fn persist_truncate(&mut self, from_index: u64) -> Result<(), RaftError> {
        if let Err(e) = self.storage.truncate(from_index).await {
            return Err(self.latch(e));
        }
        let removed = self.log.truncate_suffix(from_index);
        if removed.is_empty() {
            return Ok(());
        }
        if self.membership_index >= from_index {
            // Find the newest configuration entry still in the log.
            let mut rolled_back = None;
            for index in (self.log.first_index()..=self.log.last_index()).rev() {
                if let Some(entry) = self.log.get(index) {
                    if entry.kind == EntryKind::Configuration {
                        rolled_back = Some((Membership::decode(&entry.payload)?, index));
                        break;
                    }
                }
            }
            let (membership, index) =
                rolled_back.unwrap_or_else(|| self.committed_membership.clone());
            warn!(id = self.id, from = self.membership_index, to = index, "configuration rolled back");
            self.membership = membership;
            self.membership_index = index;
        }
        if let Some((index, reply)) = self.pending_change.take() {
            if index >= from_index {
                let _ = reply.send(Err(RaftError::Cancelled));
            } else {
                self.pending_change = Some((index, reply));
            }
        }
        Ok(())
    }

    // === Role transitions ===

    fn set_leader_hint(&mut self, leader: Option<u64>) {
        if self.leader_hint != leader {
            self.leader_hint = leader;
            self.watchers.fire(&WatchEvent::LeaderChange {
                term: self.current_term,
                leader_id: leader,
            });
        }
    }

    /// Step down to follower at `term`, persisting the term bump if there
    /// is one and resetting every leader/candidate field.
    pub async fn step_down(&mut self, term: u64) -> Result<(), RaftError> {
        let was = self.role;
        if term > self.current_term {
            self.persist_term_vote(term, None).await?;
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.prevotes.clear();
        self.progress.clear();
        self.catch_up = None;
        self.transfer_target = None;
        if let Some(reply) = self.catch_up_reply.take() {
            let _ = reply.send(Err(RaftError::NotLeader { leader_hint: self.leader_hint }));
        }
        if let Some(reply) = self.transfer_reply.take() {
            // A transfer that ends with us no longer leading did its job.
            let _ = reply.send(Ok(Bytes::new()));
        }
        self.fail_client_requests(RaftError::NotLeader { leader_hint: self.leader_hint });
        if was != Role::Follower {
            info!(id = self.id, term = self.current_term, was = ?was, "stepped down to follower");
            if was == Role::Leader {
                self.set_leader_hint(None);
            }
            self.last_contact = Instant::now();
        }
        Ok(())
    }

    fn fail_client_requests(&mut self, error: RaftError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some((_, reply)) = self.pending_change.take() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    /// Cooperative shutdown: fail outstanding continuations and drain the
    /// storage backend.
    pub async fn shutdown(&mut self) {
        self.fail_client_requests(RaftError::Shutdown);
        if let Some(reply) = self.catch_up_reply.take() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        if let Some(reply) = self.transfer_reply.take() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        if let Err(e) = self.storage.close().await {
            warn!(id = self.id, error = %e, "storage close failed");
        }
    }

    // === Elections ===

    /// Whether this node's election timer may fire at all.
    pub fn can_campaign(&self) -> bool {
        !self.unavailable && self.membership.is_voter(self.id)
    }

    /// Build the pre-vote probe: the term we *would* campaign at, with no
    /// persistent state touched.
    pub fn pre_vote_args(&mut self) -> RequestVoteArgs {
        self.prevotes.clear();
        self.prevotes.push(self.id);
        RequestVoteArgs {
            term: self.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
            pre_vote: true,
        }
    }

    /// Record one pre-vote response. Returns true once a quorum of voters
    /// has granted the probe.
    pub async fn handle_pre_vote_result(
        &mut self,
        peer_id: u64,
        result: &RequestVoteResult,
    ) -> Result<bool, RaftError> {
        if result.term > self.current_term {
            self.step_down(result.term).await?;
            return Ok(false);
        }
        if !result.pre_vote || self.role == Role::Leader {
            return Ok(false);
        }
        if result.vote_granted && !self.prevotes.contains(&peer_id) {
            self.prevotes.push(peer_id);
        }
        Ok(self.prevotes.len() >= self.quorum())
    }

    /// Enter candidate state: bump the term, vote for ourselves, persist
    /// both before any vote request leaves the node.
    pub async fn start_election(&mut self) -> Result<RequestVoteArgs, RaftError> {
        self.persist_term_vote(self.current_term + 1, Some(self.id)).await?;
        self.role = Role::Candidate;
        self.set_leader_hint(None);
        self.votes.clear();
        self.votes.push(self.id);
        self.prevotes.clear();
        self.last_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became candidate");
        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
            pre_vote: false,
        };
        // A single-voter cluster elects itself on the spot.
        if self.votes.len() >= self.quorum() {
            self.become_leader().await?;
        }
        Ok(args)
    }

    /// Whether the pre-vote probe already has a quorum (trivially true in
    /// a single-voter cluster).
    pub fn has_pre_vote_quorum(&self) -> bool {
        self.prevotes.len() >= self.quorum()
    }

    /// Handle a RequestVote RPC (real vote or pre-vote probe).
    pub async fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteResult, RaftError> {
        if args.pre_vote {
            // Pre-votes never mutate persistent state. Grant when the
            // candidate could win a real election *and* our leader has
            // actually gone quiet.
            let leader_stale = self.leader_hint.is_none()
                || self.last_contact.elapsed() >= self.config.election_timeout;
            let granted = args.term >= self.current_term
                && leader_stale
                && self.is_log_up_to_date(args.last_log_term, args.last_log_index);
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: granted,
                pre_vote: true,
            });
        }

        // Decline requests with a stale term immediately.
        if args.term < self.current_term {
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
                pre_vote: false,
            });
        }

        if args.term > self.current_term {
            self.step_down(args.term).await?;
        }

        let already_voted_other =
            self.voted_for.is_some() && self.voted_for != Some(args.candidate_id);
        let granted = !already_voted_other
            && self.is_log_up_to_date(args.last_log_term, args.last_log_index);

        if granted {
            // Persist the vote before the reply can leave the node.
            self.persist_term_vote(self.current_term, Some(args.candidate_id)).await?;
            self.last_contact = Instant::now();
            debug!(id = self.id, candidate = args.candidate_id, term = self.current_term, "granted vote");
        }

        Ok(RequestVoteResult { term: self.current_term, vote_granted: granted, pre_vote: false })
    }

    /// Check if a candidate's log is at least as up-to-date as ours:
    /// higher last term, or equal last term with last index >= ours.
    pub fn is_log_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();
        candidate_last_term > my_last_term
            || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
    }

    /// Handle one RequestVote response. Returns true if a quorum was
    /// reached and this node became leader.
    pub async fn handle_request_vote_result(
        &mut self,
        peer_id: u64,
        result: &RequestVoteResult,
    ) -> Result<bool, RaftError> {
        if result.term > self.current_term {
            self.step_down(result.term).await?;
            return Ok(false);
        }
        if self.role != Role::Candidate || result.pre_vote {
            return Ok(false);
        }
        if result.vote_granted
            && self.membership.is_voter(peer_id)
            && !self.votes.contains(&peer_id)
        {
            self.votes.push(peer_id);
        }
        if self.votes.len() >= self.quorum() {
            self.become_leader().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Become leader: reinitialize per-peer progress, then append a barrier
    /// entry so prior-term entries can commit.
    async fn become_leader(&mut self) -> Result<(), RaftError> {
        self.role = Role::Leader;
        self.set_leader_hint(Some(self.id));
        self.last_contact = Instant::now();
        info!(id = self.id, term = self.current_term, "became leader");

        let last_index = self.last_log_index();
        self.progress.clear();
        for server in self.membership.servers() {
            if server.id != self.id {
                self.progress.insert(server.id, Progress::new(last_index));
            }
        }

        let barrier = Entry::barrier(self.current_term, last_index + 1);
        self.persist_append(vec![barrier]).await?;
        // A single-voter cluster commits on its own.
        self.maybe_commit();
        Ok(())
    }

    // === AppendEntries (follower side) ===

    /// First index carrying the same term as the entry at `index`, for the
    /// conflict hint sent back to the leader.
    fn first_index_of_term_at(&self, index: u64) -> (u64, u64) {
        let Some(term) = self.term_at(index) else { return (index, 0) };
        let mut first = index;
        while first > self.log.first_index() {
            match self.term_at(first - 1) {
                Some(t) if t == term => first -= 1,
                _ => break,
            }
        }
        (first, term)
    }

    /// Handle an AppendEntries RPC (heartbeat or log replication). The
    /// result is built only after every accepted entry is durable.
    pub async fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> Result<HandleAppendEntriesOutput, RaftError> {
        if args.term > self.current_term {
            self.step_down(args.term).await?;
        }

        let reject = |term: u64, conflict_index: u64, conflict_term: u64| AppendEntriesResult {
            term,
            success: false,
            match_index: 0,
            conflict_index,
            conflict_term,
        };

        if args.term < self.current_term {
            // Stale leader; do not reset the election timer.
            return Ok(HandleAppendEntriesOutput {
                result: reject(self.current_term, 0, 0),
                leader_id: None,
            });
        }

        // Valid AppendEntries from the current leader.
        if self.role != Role::Follower {
            self.step_down(args.term).await?;
        }
        self.set_leader_hint(Some(args.leader_id));
        self.last_contact = Instant::now();

        // Log matching.
        if args.prev_log_index > self.last_log_index() {
            return Ok(HandleAppendEntriesOutput {
                result: reject(self.current_term, self.last_log_index() + 1, 0),
                leader_id: Some(args.leader_id),
            });
        }
        if args.prev_log_index > self.snapshot_last_index {
            // Below the snapshot boundary everything is committed ground
            // truth; at or above it the terms must line up.
            match self.term_at(args.prev_log_index) {
                Some(term) if term == args.prev_log_term => {}
                _ => {
                    let (conflict_index, conflict_term) =
                        self.first_index_of_term_at(args.prev_log_index);
                    return Ok(HandleAppendEntriesOutput {
                        result: reject(self.current_term, conflict_index, conflict_term),
                        leader_id: Some(args.leader_id),
                    });
                }
            }
        } else if args.prev_log_index == self.snapshot_last_index
            && self.snapshot_last_index > 0
            && args.prev_log_term != self.snapshot_last_term
        {
            return Ok(HandleAppendEntriesOutput {
                result: reject(self.current_term, self.snapshot_last_index, self.snapshot_last_term),
                leader_id: Some(args.leader_id),
            });
        }

        // Accept entries: skip what we already have, truncate on conflict,
        // persist the genuinely new suffix before replying.
        let mut to_append: Vec<Entry> = Vec::new();
        for entry in &args.entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry.clone());
                continue;
            }
            match self.log.term_of(entry.index) {
                Some(term) if term == entry.term => {} // already have it
                Some(_) => {
                    // Conflict: drop this entry and everything after it.
                    self.persist_truncate(entry.index).await?;
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }
        self.persist_append(to_append).await?;

        let match_index = args.prev_log_index + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            self.commit_index = args.leader_commit.min(match_index).max(self.commit_index);
            self.apply_committed_entries().await?;
        }

        Ok(HandleAppendEntriesOutput {
            result: AppendEntriesResult {
                term: self.current_term,
                success: true,
                match_index,
                conflict_index: 0,
                conflict_term: 0,
            },
            leader_id: Some(args.leader_id),
        })
    }

    // === Apply path ===

    /// Apply committed entries in order, resolving waiting client
    /// completions, then consider an automatic snapshot.
    pub async fn apply_committed_entries(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                // The entry must be in the window: last_applied never
                // trails the snapshot boundary.
                return Err(RaftError::Storage(StorageError::Corrupt(format!(
                    "committed entry {} missing from the log window",
                    index
                ))));
            };
            self.last_applied = index;
            match entry.kind {
                EntryKind::Command => {
                    let result = self.fsm.apply(&entry.payload);
                    if let Some(reply) = self.pending.remove(&index) {
                        let _ = reply.send(result.map_err(RaftError::StateMachine));
                    }
                }
                EntryKind::Barrier => {
                    if let Some(reply) = self.pending.remove(&index) {
                        let _ = reply.send(Ok(Bytes::new()));
                    }
                }
                EntryKind::Configuration => {
                    let membership = Membership::decode(&entry.payload)?;
                    self.committed_membership = (membership, index);
                    if let Some((change_index, reply)) = self.pending_change.take() {
                        if change_index == index {
                            let _ = reply.send(Ok(Bytes::new()));
                        } else {
                            self.pending_change = Some((change_index, reply));
                        }
                    }
                    // A leader removed from the committed configuration
                    // steps down.
                    if self.role == Role::Leader && !self.committed_membership.0.contains(self.id)
                    {
                        let term = self.current_term;
                        self.step_down(term).await?;
                    }
                }
            }
        }
        self.maybe_snapshot().await
    }

    async fn maybe_snapshot(&mut self) -> Result<(), RaftError> {
        if self.config.snapshot_threshold == 0 {
            return Ok(());
        }
        let since = self.last_applied.saturating_sub(self.snapshot_last_index);
        if since < self.config.snapshot_threshold {
            return Ok(());
        }
        debug!(id = self.id, entries = since, "automatic snapshot threshold reached");
        self.take_snapshot().await
    }

    /// Configuration in force at `index` (for snapshot metadata).
    fn membership_at(&self, index: u64) -> (Membership, u64) {
        if self.membership_index <= index {
            (self.membership.clone(), self.membership_index)
        } else {
            self.committed_membership.clone()
        }
    }

    /// Capture the state machine at `last_applied`, persist the snapshot
    /// atomically, and compact the log keeping the configured trailing
    /// window.
    pub async fn take_snapshot(&mut self) -> Result<(), RaftError> {
        if self.last_applied <= self.snapshot_last_index {
            return Ok(());
        }
        let last_term = self
            .term_at(self.last_applied)
            .expect("applied entries stay inside the window");
        let (membership, membership_index) = self.membership_at(self.last_applied);
        let data = self.fsm.snapshot().map_err(RaftError::StateMachine)?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: self.last_applied,
                last_included_term: last_term,
                membership,
                membership_index,
            },
            data,
        };
        if let Err(e) = self.storage.save_snapshot(&snapshot).await {
            return Err(self.latch(e));
        }
        self.snapshot_last_index = snapshot.meta.last_included_index;
        self.snapshot_last_term = snapshot.meta.last_included_term;

        let through = self.snapshot_last_index.saturating_sub(self.config.trailing_entries);
        if through > 0 {
            // A pinned replication batch defers compaction to the next
            // snapshot round.
            if self.log.truncate_prefix(through).is_ok() {
                if let Err(e) = self.storage.compact(through).await {
                    return Err(self.latch(e));
                }
            }
        }
        info!(
            id = self.id,
            index = self.snapshot_last_index,
            term = self.snapshot_last_term,
            "snapshot taken"
        );
        Ok(())
    }

    // === InstallSnapshot (follower side) ===

    /// Handle one chunk of an InstallSnapshot transfer.
    pub async fn handle_install_snapshot(
        &mut self,
        args: &InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, RaftError> {
        if args.term < self.current_term {
            return Ok(InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            });
        }
        if args.term > self.current_term || self.role != Role::Follower {
            self.step_down(args.term).await?;
        }
        self.set_leader_hint(Some(args.leader_id));
        self.last_contact = Instant::now();

        if args.last_included_index <= self.snapshot_last_index {
            self.pending_install = None;
            return Ok(InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!(
                    "snapshot too old: {} <= {}",
                    args.last_included_index, self.snapshot_last_index
                ),
            });
        }

        let meta = SnapshotMeta {
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            membership: args.membership.clone(),
            membership_index: args.membership_index,
        };

        if args.offset == 0 {
            self.pending_install = Some(PendingInstall::new(meta.clone()));
        }
        let Some(pending) = self.pending_install.as_mut() else {
            return Ok(InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "no transfer in progress".to_string(),
            });
        };
        if pending.meta != meta {
            self.pending_install = None;
            return Ok(InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "chunk belongs to a different snapshot".to_string(),
            });
        }
        if let Err(reason) = pending.accept(args.offset, &args.data) {
            self.pending_install = None;
            return Ok(InstallSnapshotResult::Failed { term: self.current_term, reason });
        }
        if !args.done {
            return Ok(InstallSnapshotResult::Success { term: self.current_term });
        }

        let snapshot = self.pending_install.take().expect("transfer just accepted").finish();
        self.install_snapshot(snapshot).await?;
        Ok(InstallSnapshotResult::Success { term: self.current_term })
    }

    /// Atomically adopt a complete snapshot: persist it, restore the state
    /// machine, drop covered log entries and reset the apply cursor.
    async fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), RaftError> {
        // Persist first so disk and memory cannot diverge.
        if let Err(e) = self.storage.save_snapshot(&snapshot).await {
            return Err(self.latch(e));
        }
        self.fsm.restore(&snapshot.data).map_err(RaftError::StateMachine)?;

        let meta = snapshot.meta;
        let index = meta.last_included_index;
        let term = meta.last_included_term;

        if self.log.term_of(index) == Some(term) {
            // Our log already agrees through the snapshot point: keep the
            // suffix, compact the prefix.
            let _ = self.log.truncate_prefix(index);
            if let Err(e) = self.storage.compact(index).await {
                return Err(self.latch(e));
            }
        } else {
            // Conflicting or missing history: the snapshot replaces the
            // whole log.
            let from = self.log.first_index();
            if let Err(e) = self.storage.truncate(from).await {
                return Err(self.latch(e));
            }
            self.log.reset(index, term);
        }

        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
        self.membership = meta.membership.clone();
        self.membership_index = meta.membership_index;
        self.committed_membership = (meta.membership, meta.membership_index);
        info!(id = self.id, index, term, "installed snapshot");
        Ok(())
    }

    // === Leader operations ===

    /// Append a client command, returning its index and the completion
    /// receiver that resolves when the command is applied.
    pub async fn submit(
        &mut self,
        payload: Bytes,
    ) -> Result<(u64, oneshot::Receiver<Result<Bytes, RaftError>>), RaftError> {
        if self.unavailable {
            return Err(RaftError::Storage(StorageError::Io("node unavailable".into())));
        }
        if self.role != Role::Leader {
            return Err(match self.leader_hint {
                Some(_) => RaftError::NotLeader { leader_hint: self.leader_hint },
                None => RaftError::NoLeader,
            });
        }
        if self.transfer_target.is_some() {
            return Err(RaftError::Busy);
        }
        let index = self.last_log_index() + 1;
        let entry = Entry::command(self.current_term, index, payload);
        self.persist_append(vec![entry]).await?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(index, tx);
        self.maybe_commit();
        self.apply_committed_entries().await?;
        Ok((index, rx))
    }

    /// Start a single-server membership change. The receiver resolves when
    /// the configuration entry commits (or the catch-up phase fails).
    pub async fn change_membership(
        &mut self,
        change: ChangeRequest,
    ) -> Result<oneshot::Receiver<Result<Bytes, RaftError>>, RaftError> {
        if self.role != Role::Leader {
            return Err(match self.leader_hint {
                Some(_) => RaftError::NotLeader { leader_hint: self.leader_hint },
                None => RaftError::NoLeader,
            });
        }
        // Only one change may be in flight: an uncommitted configuration
        // entry or a running catch-up both count.
        if self.membership_index > self.commit_index || self.catch_up.is_some() {
            return Err(RaftError::Busy);
        }

        let (tx, rx) = oneshot::channel();
        match change {
            ChangeRequest::Add { id, address } => {
                let mut membership = self.membership.clone();
                membership.add(Server { id, address, role: ServerRole::NonVoter })?;
                let index = self.append_configuration(membership).await?;
                self.progress.insert(id, Progress::new(self.last_log_index()));
                self.pending_change = Some((index, tx));
            }
            ChangeRequest::Remove { id } => {
                let mut membership = self.membership.clone();
                membership.remove(id)?;
                let index = self.append_configuration(membership).await?;
                self.pending_change = Some((index, tx));
            }
            ChangeRequest::Promote { id } => {
                match self.membership.get(id) {
                    None => {
                        return Err(RaftError::InvalidChange(format!(
                            "server {} not in configuration",
                            id
                        )))
                    }
                    Some(s) if s.role == ServerRole::Voter => {
                        return Err(RaftError::InvalidChange(format!(
                            "server {} is already a voter",
                            id
                        )))
                    }
                    Some(_) => {}
                }
                let target = self.last_log_index();
                let caught_up = self
                    .progress
                    .get(&id)
                    .map(|p| p.match_index >= target)
                    .unwrap_or(false);
                if caught_up {
                    let mut membership = self.membership.clone();
                    membership.promote(id)?;
                    let index = self.append_configuration(membership).await?;
                    self.pending_change = Some((index, tx));
                } else {
                    // Catch the server up first; the promotion entry is
                    // appended when a round completes fast enough.
                    info!(id = self.id, server = id, "starting promotion catch-up");
                    self.catch_up = Some(CatchUp::new(id, target));
                    self.catch_up_reply = Some(tx);
                }
            }
        }
        self.maybe_commit();
        self.apply_committed_entries().await?;
        Ok(rx)
    }

    async fn append_configuration(&mut self, membership: Membership) -> Result<u64, RaftError> {
        let index = self.last_log_index() + 1;
        let entry = Entry::configuration(self.current_term, index, membership.encode());
        self.persist_append(vec![entry]).await?;
        Ok(index)
    }

    /// Move the promotion catch-up state machine. Called whenever the
    /// target's match index advances and on every tick.
    pub async fn check_catch_up(&mut self) -> Result<(), RaftError> {
        let Some(catch_up) = &self.catch_up else { return Ok(()) };
        let id = catch_up.id;
        let target = catch_up.round_target;
        let match_index = self.progress.get(&id).map(|p| p.match_index).unwrap_or(0);
        let round_elapsed = catch_up.round_start.elapsed();
        let rounds = catch_up.rounds;

        if match_index >= target {
            if round_elapsed <= self.config.election_timeout {
                // Caught up: the final round fit inside an election
                // timeout, append the promotion entry now.
                self.catch_up = None;
                let mut membership = self.membership.clone();
                membership.promote(id)?;
                let index = self.append_configuration(membership).await?;
                if let Some(reply) = self.catch_up_reply.take() {
                    self.pending_change = Some((index, reply));
                }
                info!(id = self.id, server = id, index, "promotion entry appended");
                self.maybe_commit();
                self.apply_committed_entries().await?;
                return Ok(());
            }
            self.advance_catch_up_round(rounds)?;
        } else if round_elapsed > self.config.election_timeout {
            self.advance_catch_up_round(rounds)?;
        }
        Ok(())
    }

    fn advance_catch_up_round(&mut self, rounds: u32) -> Result<(), RaftError> {
        if rounds + 1 >= self.config.max_catch_up_rounds {
            self.catch_up = None;
            if let Some(reply) = self.catch_up_reply.take() {
                let _ = reply.send(Err(RaftError::Timeout));
            }
            warn!(id = self.id, "promotion catch-up ran out of rounds");
            return Ok(());
        }
        let target = self.last_log_index();
        if let Some(catch_up) = self.catch_up.as_mut() {
            catch_up.next_round(target);
        }
        Ok(())
    }

    /// Advance the commit index: the highest N replicated on a quorum of
    /// voters whose entry carries the current term.
    pub fn maybe_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let mut matches: Vec<u64> = self
            .membership
            .voters()
            .map(|server| {
                if server.id == self.id {
                    self.last_log_index()
                } else {
                    self.progress.get(&server.id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matches.is_empty() {
            return false;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.quorum() - 1];
        if candidate <= self.commit_index {
            return false;
        }
        // Only entries from the current term commit by counting (prior
        // terms ride along via the barrier entry).
        if self.term_at(candidate) != Some(self.current_term) {
            return false;
        }
        debug!(id = self.id, commit = candidate, "commit index advanced");
        self.commit_index = candidate;
        true
    }

    /// Handle one AppendEntries response from `peer_id`.
    pub async fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        result: &AppendEntriesResult,
    ) -> Result<(), RaftError> {
        if result.term > self.current_term {
            self.step_down(result.term).await?;
            return Ok(());
        }
        if self.role != Role::Leader {
            return Ok(());
        }
        let last_index = self.last_log_index();
        let Some(progress) = self.progress.get_mut(&peer_id) else { return Ok(()) };
        if result.success {
            progress.on_success(result.match_index.min(last_index));
        } else {
            let hint = if result.conflict_index == 0 { 1 } else { result.conflict_index };
            progress.on_conflict(hint);
        }
        if self.maybe_commit() {
            self.apply_committed_entries().await?;
        }
        self.check_catch_up().await?;
        Ok(())
    }

    // === Outbound replication ===

    /// Peers the leader replicates to this turn: voters and non-voters,
    /// plus a spare while it is being caught up for promotion.
    pub fn replication_targets(&self) -> Vec<u64> {
        self.membership
            .servers()
            .iter()
            .filter(|s| s.id != self.id)
            .filter(|s| {
                s.role != ServerRole::Spare
                    || self.catch_up.as_ref().is_some_and(|c| c.id == s.id)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Voting peers asked for (pre-)votes.
    pub fn voter_peers(&self) -> Vec<u64> {
        self.membership.voters().map(|s| s.id).filter(|&id| id != self.id).collect()
    }

    /// Build the next message for one peer: an AppendEntries batch (empty
    /// heartbeat when it is caught up), the next InstallSnapshot chunk, or
    /// nothing while its pipeline is full. Entries handed out are pinned
    /// against compaction until the response comes back.
    pub fn prepare_peer_message(&mut self, peer_id: u64) -> Option<PeerMessage> {
        let max_inflight = self.config.max_inflight_appends;
        let batch = self.config.max_batch_entries;

        let needs_snapshot = {
            let progress = self.progress.get(&peer_id)?;
            if progress.snapshot.is_some() {
                return self
                    .next_snapshot_chunk(peer_id)
                    .map(|args| PeerMessage::Snapshot { args });
            }
            if !progress.can_send(max_inflight) {
                return None;
            }
            progress.next_index < self.log.first_index()
        };
        if needs_snapshot {
            // The entries this peer needs were compacted away.
            if let Err(e) = self.begin_snapshot_transfer(peer_id) {
                warn!(id = self.id, peer = peer_id, error = %e, "cannot start snapshot transfer");
                return None;
            }
            return self.next_snapshot_chunk(peer_id).map(|args| PeerMessage::Snapshot { args });
        }

        let next = self.progress.get(&peer_id)?.next_index;
        let prev_log_index = next - 1;
        let prev_log_term =
            if prev_log_index == 0 { 0 } else { self.term_at(prev_log_index)? };
        let last = self.last_log_index();
        let entries =
            if next > last { Vec::new() } else { self.log.range(next, (next + batch - 1).min(last)) };
        let pin = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => Some(self.log.acquire(first.index, last.index)),
            _ => None,
        };
        let last_sent = entries.last().map(|e| e.index);
        let args = AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        if let Some(progress) = self.progress.get_mut(&peer_id) {
            progress.inflight += 1;
            // Advance optimistically so the next pipelined batch continues
            // where this one ends; rejection hints wind it back.
            if let Some(last_sent) = last_sent {
                progress.next_index = progress.next_index.max(last_sent + 1);
            }
        }
        Some(PeerMessage::Append { args, pin })
    }

    /// Release the bookkeeping taken by [`RaftCore::prepare_peer_message`]
    /// once the peer's response (or the transport failure) arrived. A batch
    /// lost in transit rewinds `next_index` to certain ground.
    pub fn finish_peer_append(&mut self, peer_id: u64, pin: Option<u64>, delivered: bool) {
        if let Some(pin) = pin {
            self.log.release(pin);
        }
        if let Some(progress) = self.progress.get_mut(&peer_id) {
            progress.inflight = progress.inflight.saturating_sub(1);
            if !delivered {
                progress.next_index = progress.match_index + 1;
            }
        }
    }

    // === Leadership transfer ===

    /// Begin transferring leadership. With no explicit target the most
    /// caught-up voter is chosen. The returned receiver resolves once this
    /// node has stepped down (or the transfer times out).
    pub fn transfer_leadership(
        &mut self,
        target: Option<u64>,
    ) -> Result<oneshot::Receiver<Result<Bytes, RaftError>>, RaftError> {
        if self.role != Role::Leader {
            return Err(match self.leader_hint {
                Some(_) => RaftError::NotLeader { leader_hint: self.leader_hint },
                None => RaftError::NoLeader,
            });
        }
        if self.transfer_target.is_some() {
            return Err(RaftError::Busy);
        }
        let target = match target {
            Some(id) => {
                if id == self.id || !self.membership.is_voter(id) {
                    return Err(RaftError::InvalidChange(format!(
                        "server {} cannot receive leadership",
                        id
                    )));
                }
                id
            }
            None => self
                .membership
                .voters()
                .filter(|s| s.id != self.id)
                .max_by_key(|s| self.progress.get(&s.id).map(|p| p.match_index).unwrap_or(0))
                .map(|s| s.id)
                .ok_or(RaftError::InvalidChange("no voter to transfer to".into()))?,
        };
        info!(id = self.id, target, "transferring leadership");
        self.transfer_target = Some((target, Instant::now()));
        let (tx, rx) = oneshot::channel();
        self.transfer_reply = Some(tx);
        Ok(rx)
    }

    /// The TimeoutNow to emit this turn, if the transfer target is caught
    /// up. May fire again on the next turn until the transfer concludes;
    /// the RPC is idempotent on the receiver.
    pub fn take_timeout_now(&mut self) -> Option<(u64, TimeoutNowArgs)> {
        let (target, _) = self.transfer_target?;
        let caught_up = self
            .progress
            .get(&target)
            .map(|p| p.match_index >= self.last_log_index())
            .unwrap_or(false);
        if !caught_up {
            return None;
        }
        Some((target, TimeoutNowArgs { term: self.current_term, leader_id: self.id }))
    }

    /// Handle a TimeoutNow RPC: start an election immediately, skipping
    /// pre-vote. Returns the vote request to broadcast, if any.
    pub async fn handle_timeout_now(
        &mut self,
        args: &TimeoutNowArgs,
    ) -> Result<(TimeoutNowResult, Option<RequestVoteArgs>), RaftError> {
        if args.term < self.current_term || self.role == Role::Leader || !self.can_campaign() {
            return Ok((TimeoutNowResult { term: self.current_term }, None));
        }
        let vote_args = self.start_election().await?;
        Ok((TimeoutNowResult { term: self.current_term }, Some(vote_args)))
    }

    // === Periodic work ===

    /// Coarse timer pass, run on every heartbeat tick.
    pub async fn tick(&mut self) -> Result<(), RaftError> {
        // Abandon a half-finished inbound snapshot whose chunks stopped.
        if let Some(pending) = &self.pending_install {
            if pending.last_chunk.elapsed() > self.config.snapshot_chunk_timeout {
                warn!(id = self.id, "snapshot install timed out between chunks");
                self.pending_install = None;
            }
        }

        if self.role != Role::Leader {
            return Ok(());
        }

        // Abort a transfer that made no progress inside an election
        // timeout.
        if let Some((_, started)) = self.transfer_target {
            if started.elapsed() > self.config.election_timeout {
                self.transfer_target = None;
                if let Some(reply) = self.transfer_reply.take() {
                    let _ = reply.send(Err(RaftError::Timeout));
                }
            }
        }

        self.check_catch_up().await?;

        // Check-quorum: a leader cut off from a quorum of voters steps
        // down instead of uselessly holding the term.
        if self.config.check_quorum {
            let timeout = self.config.election_timeout;
            let heard: usize = self
                .membership
                .voters()
                .filter(|s| {
                    s.id == self.id
                        || self
                            .progress
                            .get(&s.id)
                            .and_then(|p| p.last_contact)
                            .is_some_and(|at| at.elapsed() < timeout)
                })
                .count();
            if heard < self.quorum() {
                warn!(id = self.id, term = self.current_term, "lost quorum contact, stepping down");
                let term = self.current_term;
                self.step_down(term).await?;
            }
        }
        Ok(())
    }

    // === Snapshot transfer (leader side) ===

    /// Begin streaming a snapshot to a peer whose needed entries were
    /// compacted away.
    pub fn begin_snapshot_transfer(&mut self, peer_id: u64) -> Result<(), RaftError> {
        let snapshot = self
            .storage
            .load_snapshot()
            .map_err(|e| self.latch(e))?
            .ok_or_else(|| RaftError::Storage(StorageError::Corrupt(
                "compacted log without a snapshot".into(),
            )))?;
        if let Some(progress) = self.progress.get_mut(&peer_id) {
            progress.snapshot = Some(SnapshotTransfer {
                meta: snapshot.meta,
                data: snapshot.data,
                offset: 0,
                started: Instant::now(),
            });
        }
        Ok(())
    }

    /// Next chunk to send to `peer_id`, if a transfer is active.
    pub fn next_snapshot_chunk(&mut self, peer_id: u64) -> Option<InstallSnapshotArgs> {
        let term = self.current_term;
        let id = self.id;
        let chunk_size = self.config.snapshot_chunk_size;
        let progress = self.progress.get_mut(&peer_id)?;
        let transfer = progress.snapshot.as_ref()?;
        let offset = transfer.offset as usize;
        let end = (offset + chunk_size).min(transfer.data.len());
        let done = end == transfer.data.len();
        Some(InstallSnapshotArgs {
            term,
            leader_id: id,
            last_included_index: transfer.meta.last_included_index,
            last_included_term: transfer.meta.last_included_term,
            membership: transfer.meta.membership.clone(),
            membership_index: transfer.meta.membership_index,
            offset: offset as u64,
            data: transfer.data.slice(offset..end),
            done,
        })
    }

    /// Handle an InstallSnapshot response for the chunk that ended at
    /// `acked_offset`.
    pub async fn handle_install_snapshot_result(
        &mut self,
        peer_id: u64,
        acked_end: u64,
        result: &InstallSnapshotResult,
    ) -> Result<(), RaftError> {
        let response_term = match result {
            InstallSnapshotResult::Success { term } => *term,
            InstallSnapshotResult::Failed { term, .. } => *term,
        };
        if response_term > self.current_term {
            self.step_down(response_term).await?;
            return Ok(());
        }
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(&peer_id) else { return Ok(()) };
        let Some(transfer) = progress.snapshot.as_mut() else { return Ok(()) };
        match result {
            InstallSnapshotResult::Success { .. } => {
                transfer.offset = acked_end;
                if transfer.done() {
                    let index = transfer.meta.last_included_index;
                    progress.snapshot = None;
                    progress.on_success(index);
                    debug!(id = self.id, peer = peer_id, index, "snapshot transfer complete");
                }
            }
            InstallSnapshotResult::Failed { reason, .. } => {
                warn!(id = self.id, peer = peer_id, reason, "snapshot transfer failed");
                progress.snapshot = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{AppliedCommands, TestStateMachine};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_election_timeout(Duration::from_millis(100))
            .with_heartbeat_interval(Duration::from_millis(10))
    }

    async fn test_core(id: u64, voters: &[u64]) -> RaftCore {
        test_core_with_fsm(id, voters, Box::new(TestStateMachine::new())).await
    }

    async fn test_core_with_fsm(
        id: u64,
        voters: &[u64],
        fsm: Box<dyn Snapshotable>,
    ) -> RaftCore {
        let mut core =
            RaftCore::new(id, test_config(), Box::new(MemoryStorage::new()), fsm).unwrap();
        let mut membership = Membership::new();
        for &v in voters {
            membership
                .add(Server { id: v, address: format!("node-{v}"), role: ServerRole::Voter })
                .unwrap();
        }
        core.persist_append(vec![Entry::configuration(0, 1, membership.encode())])
            .await
            .unwrap();
        core
    }

    fn grant(term: u64) -> RequestVoteResult {
        RequestVoteResult { term, vote_granted: true, pre_vote: false }
    }

    fn deny(term: u64) -> RequestVoteResult {
        RequestVoteResult { term, vote_granted: false, pre_vote: false }
    }

    fn ok_append(term: u64, match_index: u64) -> AppendEntriesResult {
        AppendEntriesResult { term, success: true, match_index, conflict_index: 0, conflict_term: 0 }
    }

    async fn make_leader(core: &mut RaftCore) {
        core.start_election().await.unwrap();
        let voters: Vec<u64> =
            core.membership.voters().map(|s| s.id).filter(|&v| v != core.id).collect();
        for peer in voters {
            if core.is_leader() {
                break;
            }
            core.handle_request_vote_result(peer, &grant(core.current_term)).await.unwrap();
        }
        assert!(core.is_leader());
    }

    fn heartbeat(term: u64, leader_id: u64, leader_commit: u64) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit,
        }
    }

    #[tokio::test]
    async fn new_node_starts_as_follower() {
        let core = test_core(1, &[1, 2, 3]).await;
        assert_eq!(core.id, 1);
        assert_eq!(core.current_term, 0);
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.last_log_index(), 1); // bootstrap configuration entry
        assert_eq!(core.membership.voter_count(), 3);
    }

    #[tokio::test]
    async fn election_bumps_term_and_votes_for_self() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.start_election().await.unwrap();
        assert_eq!(core.role, Role::Candidate);
        assert_eq!(core.current_term, 1);
        assert_eq!(core.voted_for, Some(1));
    }

    #[tokio::test]
    async fn single_voter_elects_itself_immediately() {
        let mut core = test_core(1, &[1]).await;
        core.start_election().await.unwrap();
        assert!(core.is_leader());
    }

    #[tokio::test]
    async fn vote_granted_and_persisted() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 0,
            pre_vote: false,
        };
        let result = core.handle_request_vote(&args).await.unwrap();
        assert!(result.vote_granted);
        assert_eq!(core.voted_for, Some(2));
    }

    #[tokio::test]
    async fn vote_denied_stale_term() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.persist_term_vote(5, None).await.unwrap();
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 10,
            last_log_term: 3,
            pre_vote: false,
        };
        let result = core.handle_request_vote(&args).await.unwrap();
        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(core.voted_for, None);
    }

    #[tokio::test]
    async fn at_most_one_vote_per_term() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let mut args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 0,
            pre_vote: false,
        };
        assert!(core.handle_request_vote(&args).await.unwrap().vote_granted);

        // Another candidate in the same term is refused.
        args.candidate_id = 3;
        assert!(!core.handle_request_vote(&args).await.unwrap().vote_granted);
        assert_eq!(core.voted_for, Some(2));

        // A retransmission from the first candidate is granted again.
        args.candidate_id = 2;
        assert!(core.handle_request_vote(&args).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn vote_denied_when_candidate_log_is_behind() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.persist_append(vec![
            Entry::command(2, 2, Bytes::from_static(b"x")),
            Entry::command(2, 3, Bytes::from_static(b"y")),
        ])
        .await
        .unwrap();

        // Lower last term.
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 9,
            last_log_term: 1,
            pre_vote: false,
        };
        assert!(!core.handle_request_vote(&args).await.unwrap().vote_granted);
        // Term bump still happened.
        assert_eq!(core.current_term, 3);

        // Same last term, shorter log.
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 2,
            last_log_term: 2,
            pre_vote: false,
        };
        assert!(!core.handle_request_vote(&args).await.unwrap().vote_granted);

        // Higher last term wins regardless of length.
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 3,
            pre_vote: false,
        };
        assert!(core.handle_request_vote(&args).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn pre_vote_does_not_touch_persistent_state() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 0,
            pre_vote: true,
        };
        let result = core.handle_request_vote(&args).await.unwrap();
        assert!(result.vote_granted);
        assert!(result.pre_vote);
        assert_eq!(core.current_term, 0);
        assert_eq!(core.voted_for, None);
    }

    #[tokio::test]
    async fn pre_vote_denied_while_leader_is_live() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        // Hear from a leader right now.
        core.handle_append_entries(&heartbeat(1, 2, 0)).await.unwrap();
        let args = RequestVoteArgs {
            term: 2,
            candidate_id: 3,
            last_log_index: 1,
            last_log_term: 0,
            pre_vote: true,
        };
        let result = core.handle_request_vote(&args).await.unwrap();
        assert!(!result.vote_granted);
        // A real vote at a higher term is still honoured.
        let args = RequestVoteArgs { pre_vote: false, ..args };
        assert!(core.handle_request_vote(&args).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn pre_vote_quorum_then_real_election() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let args = core.pre_vote_args();
        assert_eq!(args.term, 1);
        assert_eq!(core.current_term, 0);
        let pre = RequestVoteResult { term: 0, vote_granted: true, pre_vote: true };
        let reached = core.handle_pre_vote_result(2, &pre).await.unwrap();
        assert!(reached);
        core.start_election().await.unwrap();
        assert_eq!(core.current_term, 1);
        assert_eq!(core.role, Role::Candidate);
    }

    #[tokio::test]
    async fn candidate_wins_with_quorum_and_appends_barrier() {
        let mut core = test_core(1, &[1, 2, 3, 4, 5]).await;
        core.start_election().await.unwrap();
        assert!(!core.handle_request_vote_result(2, &grant(1)).await.unwrap());
        assert!(!core.handle_request_vote_result(3, &deny(1)).await.unwrap());
        let became = core.handle_request_vote_result(4, &grant(1)).await.unwrap();
        assert!(became);
        assert!(core.is_leader());
        let barrier = core.log.get(core.last_log_index()).unwrap();
        assert_eq!(barrier.kind, EntryKind::Barrier);
        assert_eq!(barrier.term, 1);
    }

    #[tokio::test]
    async fn duplicate_votes_count_once() {
        let mut core = test_core(1, &[1, 2, 3, 4, 5]).await;
        core.start_election().await.unwrap();
        assert!(!core.handle_request_vote_result(2, &grant(1)).await.unwrap());
        assert!(!core.handle_request_vote_result(2, &grant(1)).await.unwrap());
        assert_eq!(core.role, Role::Candidate);
    }

    #[tokio::test]
    async fn candidate_steps_down_on_higher_term_response() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.start_election().await.unwrap();
        core.handle_request_vote_result(2, &deny(7)).await.unwrap();
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.current_term, 7);
        assert_eq!(core.voted_for, None);
    }

    #[tokio::test]
    async fn append_entries_accepts_and_is_idempotent() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 0,
            entries: vec![Entry::command(1, 2, Bytes::from_static(b"SET x 1"))],
            leader_commit: 0,
        };
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(output.result.success);
        assert_eq!(output.result.match_index, 2);
        assert_eq!(output.leader_id, Some(2));
        assert_eq!(core.last_log_index(), 2);

        // Retransmission leaves the log unchanged.
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(output.result.success);
        assert_eq!(core.last_log_index(), 2);
    }

    #[tokio::test]
    async fn append_entries_stale_term_does_not_reset_timer() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.persist_term_vote(2, None).await.unwrap();
        let before = core.last_contact;
        let output = core.handle_append_entries(&heartbeat(1, 2, 0)).await.unwrap();
        assert!(!output.result.success);
        assert_eq!(output.leader_id, None);
        assert_eq!(core.last_contact, before);
    }

    #[tokio::test]
    async fn append_entries_conflict_hint_when_log_short() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 7,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 0,
        };
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(!output.result.success);
        assert_eq!(output.result.conflict_index, core.last_log_index() + 1);
    }

    #[tokio::test]
    async fn append_entries_conflict_hint_names_first_index_of_term() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        // Entries 2..=4 all carry term 2.
        core.persist_append(vec![
            Entry::command(2, 2, Bytes::from_static(b"a")),
            Entry::command(2, 3, Bytes::from_static(b"b")),
            Entry::command(2, 4, Bytes::from_static(b"c")),
        ])
        .await
        .unwrap();

        let args = AppendEntriesArgs {
            term: 3,
            leader_id: 2,
            prev_log_index: 4,
            prev_log_term: 3, // mismatch, we have term 2
            entries: vec![],
            leader_commit: 0,
        };
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(!output.result.success);
        assert_eq!(output.result.conflict_index, 2);
        assert_eq!(output.result.conflict_term, 2);
    }

    #[tokio::test]
    async fn append_entries_truncates_conflicting_suffix() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.persist_append(vec![
            Entry::command(1, 2, Bytes::from_static(b"keep")),
            Entry::command(1, 3, Bytes::from_static(b"old")),
        ])
        .await
        .unwrap();

        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![Entry::command(2, 3, Bytes::from_static(b"new"))],
            leader_commit: 0,
        };
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(output.result.success);
        assert_eq!(core.last_log_index(), 3);
        assert_eq!(core.log.get(3).unwrap().term, 2);
        assert_eq!(&core.log.get(3).unwrap().payload[..], b"new");
    }

    #[tokio::test]
    async fn commit_advances_with_leader_commit_but_not_past_new_entries() {
        let applied: AppliedCommands = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let fsm = Box::new(TestStateMachine::new_shared(applied.clone()));
        let mut core = test_core_with_fsm(1, &[1, 2, 3], fsm).await;
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 0,
            entries: vec![Entry::command(1, 2, Bytes::from_static(b"x=1"))],
            leader_commit: 9, // ahead of what it sent
        };
        let output = core.handle_append_entries(&args).await.unwrap();
        assert!(output.result.success);
        assert_eq!(core.commit_index, 2);
        assert_eq!(core.last_applied, 2);
        assert_eq!(applied.lock().as_slice(), &[Bytes::from_static(b"x=1")]);
    }

    #[tokio::test]
    async fn candidate_steps_down_on_append_entries_from_new_leader() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.start_election().await.unwrap();
        let output = core.handle_append_entries(&heartbeat(1, 2, 0)).await.unwrap();
        assert!(output.result.success);
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.leader_hint, Some(2));
    }

    #[tokio::test]
    async fn leader_commits_on_quorum_and_fires_completion() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        let (index, rx) = core.submit(Bytes::from_static(b"x=1")).await.unwrap();
        assert_eq!(core.commit_index, 0);

        core.handle_append_entries_result(2, &ok_append(1, index)).await.unwrap();
        assert_eq!(core.commit_index, index);
        assert_eq!(core.last_applied, index);
        let result = rx.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn leader_does_not_commit_prior_term_entries_by_counting() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        // A leftover entry from an old term.
        core.persist_append(vec![Entry::command(1, 2, Bytes::from_static(b"old"))])
            .await
            .unwrap();
        core.persist_term_vote(4, None).await.unwrap();
        make_leader(&mut core).await;
        assert_eq!(core.current_term, 5);
        let barrier_index = core.last_log_index();

        // Quorum on the old entry alone must not commit it.
        core.handle_append_entries_result(2, &ok_append(5, 2)).await.unwrap();
        assert_eq!(core.commit_index, 0);

        // Quorum on the barrier commits everything up to it.
        core.handle_append_entries_result(2, &ok_append(5, barrier_index)).await.unwrap();
        assert_eq!(core.commit_index, barrier_index);
    }

    #[tokio::test]
    async fn submit_rejected_on_follower_with_hint() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        assert!(matches!(
            core.submit(Bytes::from_static(b"x")).await,
            Err(RaftError::NoLeader)
        ));
        core.handle_append_entries(&heartbeat(1, 2, 0)).await.unwrap();
        assert!(matches!(
            core.submit(Bytes::from_static(b"x")).await,
            Err(RaftError::NotLeader { leader_hint: Some(2) })
        ));
    }

    #[tokio::test]
    async fn single_voter_submit_commits_immediately() {
        let mut core = test_core(1, &[1]).await;
        core.start_election().await.unwrap();
        let (index, rx) = core.submit(Bytes::from_static(b"x=1")).await.unwrap();
        assert_eq!(core.commit_index, index);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_append_result() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        let (_, rx) = core.submit(Bytes::from_static(b"x")).await.unwrap();
        core.handle_append_entries_result(2, &AppendEntriesResult {
            term: 9,
            success: false,
            match_index: 0,
            conflict_index: 0,
            conflict_term: 0,
        })
        .await
        .unwrap();
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.current_term, 9);
        // The pending submission resolves with an error.
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn conflict_hint_backtracks_next_index() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        for i in 0..4 {
            core.submit(Bytes::from(format!("c{i}"))).await.unwrap();
        }
        let fail = AppendEntriesResult {
            term: core.current_term,
            success: false,
            match_index: 0,
            conflict_index: 2,
            conflict_term: 0,
        };
        core.handle_append_entries_result(2, &fail).await.unwrap();
        assert_eq!(core.progress.get(&2).unwrap().next_index, 2);
    }

    // === Membership changes ===

    #[tokio::test]
    async fn add_server_takes_effect_at_append_time() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        // Commit the barrier so the change is allowed.
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();

        let rx = core
            .change_membership(ChangeRequest::Add { id: 4, address: "node-4".into() })
            .await
            .unwrap();
        // In force immediately, before commit.
        assert!(core.membership.contains(4));
        assert_eq!(core.membership.get(4).unwrap().role, ServerRole::NonVoter);
        assert_eq!(core.membership.voter_count(), 3);

        // A second change while the first is uncommitted is refused.
        assert!(matches!(
            core.change_membership(ChangeRequest::Remove { id: 3 }).await,
            Err(RaftError::Busy)
        ));

        // Commit it; the completion fires.
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn remove_server_shrinks_configuration() {
        let mut core = test_core(1, &[1, 2, 3, 4, 5]).await;
        make_leader(&mut core).await;
        for peer in [2, 3, 4] {
            core.handle_append_entries_result(peer, &ok_append(1, core.last_log_index()))
                .await
                .unwrap();
        }
        let rx = core.change_membership(ChangeRequest::Remove { id: 5 }).await.unwrap();
        assert!(!core.membership.contains(5));
        assert_eq!(core.membership.voter_count(), 4);
        for peer in [2, 3, 4] {
            core.handle_append_entries_result(peer, &ok_append(1, core.last_log_index()))
                .await
                .unwrap();
        }
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn promote_caught_up_server_appends_entry_directly() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        core.change_membership(ChangeRequest::Add { id: 4, address: "node-4".into() })
            .await
            .unwrap();
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();

        // The new server is fully caught up.
        core.handle_append_entries_result(4, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        let rx = core.change_membership(ChangeRequest::Promote { id: 4 }).await.unwrap();
        assert_eq!(core.membership.get(4).unwrap().role, ServerRole::Voter);
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        core.handle_append_entries_result(4, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn promote_lagging_server_runs_catch_up_first() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        core.change_membership(ChangeRequest::Add { id: 4, address: "node-4".into() })
            .await
            .unwrap();
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();

        let _rx = core.change_membership(ChangeRequest::Promote { id: 4 }).await.unwrap();
        // No promotion entry yet; the catch-up is running.
        assert_eq!(core.membership.get(4).unwrap().role, ServerRole::NonVoter);

        // The target reports having caught up; the round finished fast, so
        // the promotion entry is appended.
        core.handle_append_entries_result(4, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        assert_eq!(core.membership.get(4).unwrap().role, ServerRole::Voter);
    }

    #[tokio::test]
    async fn truncation_rolls_back_uncommitted_configuration() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        // An uncommitted configuration entry arrives from a leader...
        let mut bigger = core.membership.clone();
        bigger.add(Server { id: 4, address: "node-4".into(), role: ServerRole::NonVoter }).unwrap();
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 0,
            entries: vec![Entry::configuration(1, 2, bigger.encode())],
            leader_commit: 0,
        };
        core.handle_append_entries(&args).await.unwrap();
        assert!(core.membership.contains(4));

        // ...and a newer leader truncates it away.
        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 3,
            prev_log_index: 1,
            prev_log_term: 0,
            entries: vec![Entry::command(2, 2, Bytes::from_static(b"z"))],
            leader_commit: 0,
        };
        core.handle_append_entries(&args).await.unwrap();
        assert!(!core.membership.contains(4));
        assert_eq!(core.membership.voter_count(), 3);
    }

    // === Snapshots ===

    #[tokio::test]
    async fn snapshot_taken_at_threshold_and_log_compacted() {
        let mut core = test_core(1, &[1]).await;
        core.config.snapshot_threshold = 8;
        core.config.trailing_entries = 2;
        core.start_election().await.unwrap();
        for i in 0..10 {
            core.submit(Bytes::from(format!("SET k{i} v"))).await.unwrap();
        }
        assert!(core.snapshot_last_index > 0);
        assert!(core.log.first_index() > 1);
        assert_eq!(core.log.first_index(), core.snapshot_last_index - 1);
    }

    #[tokio::test]
    async fn install_snapshot_in_chunks_resets_follower() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let membership = core.membership.clone();
        let fsm_state = TestStateMachine::new().snapshot().unwrap();
        let meta = |offset: u64, data: &'static [u8], done: bool| InstallSnapshotArgs {
            term: 2,
            leader_id: 2,
            last_included_index: 20,
            last_included_term: 2,
            membership: membership.clone(),
            membership_index: 1,
            offset,
            data: Bytes::from_static(data),
            done,
        };
        let half = fsm_state.len() / 2;
        let first: &'static [u8] = Box::leak(fsm_state[..half].to_vec().into_boxed_slice());
        let second: &'static [u8] = Box::leak(fsm_state[half..].to_vec().into_boxed_slice());

        let r = core.handle_install_snapshot(&meta(0, first, false)).await.unwrap();
        assert!(matches!(r, InstallSnapshotResult::Success { .. }));
        let r = core
            .handle_install_snapshot(&meta(half as u64, second, true))
            .await
            .unwrap();
        assert!(matches!(r, InstallSnapshotResult::Success { .. }));

        assert_eq!(core.snapshot_last_index, 20);
        assert_eq!(core.snapshot_last_term, 2);
        assert_eq!(core.commit_index, 20);
        assert_eq!(core.last_applied, 20);
        assert_eq!(core.last_log_index(), 20);
        assert_eq!(core.current_term, 2);
    }

    #[tokio::test]
    async fn append_entries_at_exact_snapshot_boundary() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let membership = core.membership.clone();
        let data = TestStateMachine::new().snapshot().unwrap();
        let args = InstallSnapshotArgs {
            term: 2,
            leader_id: 2,
            last_included_index: 20,
            last_included_term: 2,
            membership,
            membership_index: 1,
            offset: 0,
            data,
            done: true,
        };
        core.handle_install_snapshot(&args).await.unwrap();
        assert_eq!(core.snapshot_last_index, 20);

        // prev exactly at the boundary with the matching term is accepted.
        let append = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 20,
            prev_log_term: 2,
            entries: vec![Entry::command(2, 21, Bytes::from_static(b"next"))],
            leader_commit: 20,
        };
        let output = core.handle_append_entries(&append).await.unwrap();
        assert!(output.result.success);
        assert_eq!(core.last_log_index(), 21);

        // A mismatched boundary term is refused.
        let bad = AppendEntriesArgs { prev_log_term: 1, entries: vec![], ..append };
        let output = core.handle_append_entries(&bad).await.unwrap();
        assert!(!output.result.success);
    }

    #[tokio::test]
    async fn install_snapshot_rejects_wrong_offset() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        let membership = core.membership.clone();
        let args = InstallSnapshotArgs {
            term: 2,
            leader_id: 2,
            last_included_index: 20,
            last_included_term: 2,
            membership,
            membership_index: 1,
            offset: 100, // transfer never started
            data: Bytes::from_static(b"chunk"),
            done: false,
        };
        let r = core.handle_install_snapshot(&args).await.unwrap();
        assert!(matches!(r, InstallSnapshotResult::Failed { .. }));
    }

    #[tokio::test]
    async fn install_snapshot_older_than_local_is_rejected() {
        let mut core = test_core(1, &[1]).await;
        core.config.snapshot_threshold = 4;
        core.start_election().await.unwrap();
        for i in 0..6 {
            core.submit(Bytes::from(format!("c{i}"))).await.unwrap();
        }
        let local = core.snapshot_last_index;
        assert!(local > 0);
        let args = InstallSnapshotArgs {
            term: core.current_term,
            leader_id: 2,
            last_included_index: local, // not newer
            last_included_term: 1,
            membership: core.membership.clone(),
            membership_index: 1,
            offset: 0,
            data: Bytes::from_static(b"old"),
            done: true,
        };
        let r = core.handle_install_snapshot(&args).await.unwrap();
        assert!(matches!(r, InstallSnapshotResult::Failed { .. }));
    }

    #[tokio::test]
    async fn leader_streams_snapshot_chunks_to_lagging_peer() {
        let mut core = test_core(1, &[1]).await;
        core.config.snapshot_threshold = 4;
        core.config.trailing_entries = 0;
        core.config.snapshot_chunk_size = 8;
        core.start_election().await.unwrap();
        for i in 0..6 {
            core.submit(Bytes::from(format!("c{i}"))).await.unwrap();
        }
        assert!(core.snapshot_last_index > 0);

        // Pretend a lagging peer exists.
        core.progress.insert(9, Progress::new(0));
        core.begin_snapshot_transfer(9).unwrap();

        let mut end = 0;
        let mut chunks = 0;
        loop {
            let chunk = core.next_snapshot_chunk(9).expect("transfer active");
            assert_eq!(chunk.offset, end);
            end = chunk.offset + chunk.data.len() as u64;
            chunks += 1;
            let done = chunk.done;
            core.handle_install_snapshot_result(
                9,
                end,
                &InstallSnapshotResult::Success { term: core.current_term },
            )
            .await
            .unwrap();
            if done {
                break;
            }
        }
        assert!(chunks > 1, "payload should span several chunks");
        let p = core.progress.get(&9).unwrap();
        assert!(p.snapshot.is_none());
        assert_eq!(p.match_index, core.snapshot_last_index);
        assert_eq!(p.next_index, core.snapshot_last_index + 1);
    }

    // === Leadership transfer / timeout-now ===

    #[tokio::test]
    async fn transfer_emits_timeout_now_when_target_caught_up() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        core.handle_append_entries_result(2, &ok_append(1, core.last_log_index()))
            .await
            .unwrap();
        let _rx = core.transfer_leadership(Some(2)).unwrap();
        let (target, args) = core.take_timeout_now().expect("target is caught up");
        assert_eq!(target, 2);
        assert_eq!(args.term, core.current_term);

        // New commands are refused while transferring.
        assert!(matches!(
            core.submit(Bytes::from_static(b"x")).await,
            Err(RaftError::Busy)
        ));
    }

    #[tokio::test]
    async fn timeout_now_starts_election_skipping_pre_vote() {
        let mut core = test_core(2, &[1, 2, 3]).await;
        core.handle_append_entries(&heartbeat(3, 1, 0)).await.unwrap();
        let (result, vote_args) = core
            .handle_timeout_now(&TimeoutNowArgs { term: 3, leader_id: 1 })
            .await
            .unwrap();
        assert_eq!(result.term, 4);
        let vote_args = vote_args.expect("election started");
        assert!(!vote_args.pre_vote);
        assert_eq!(core.role, Role::Candidate);
        assert_eq!(core.current_term, 4);
    }

    #[tokio::test]
    async fn check_quorum_steps_down_isolated_leader() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        core.config.election_timeout = Duration::from_millis(1);
        make_leader(&mut core).await;
        // No peer contact at all; after the timeout the tick steps down.
        tokio::time::sleep(Duration::from_millis(5)).await;
        core.tick().await.unwrap();
        assert_eq!(core.role, Role::Follower);
    }

    #[tokio::test]
    async fn watch_fires_on_term_and_leader_changes() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut core = test_core(1, &[1, 2, 3]).await;
        let sink = events.clone();
        core.watchers
            .register(Box::new(move |e: &WatchEvent| sink.lock().push(e.clone())))
            .unwrap();

        core.handle_append_entries(&heartbeat(2, 3, 0)).await.unwrap();
        let seen = events.lock().clone();
        assert!(seen.contains(&WatchEvent::TermChange { term: 2 }));
        assert!(seen.contains(&WatchEvent::LeaderChange { term: 2, leader_id: Some(3) }));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let mut core = test_core(1, &[1, 2, 3]).await;
        make_leader(&mut core).await;
        let (_, rx) = core.submit(Bytes::from_static(b"x")).await.unwrap();
        core.shutdown().await;
        assert!(matches!(rx.await.unwrap(), Err(RaftError::Shutdown)));
    }
}
