//! Typed RPC messages exchanged between nodes.
//!
//! The transport moves these values; the codec in `transport::codec`
//! defines a stable framing for transports that need one.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::log::Entry;
use crate::core::membership::Membership;

/// RequestVote RPC arguments.
///
/// Also used for the pre-vote probe: a pre-vote carries the term the
/// candidate *would* move to, without the candidate having bumped its
/// persistent term yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term (prospective term for a pre-vote).
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_id: u64,
    /// Index of candidate's last log entry.
    pub last_log_index: u64,
    /// Term of candidate's last log entry.
    pub last_log_term: u64,
    /// True if this is a non-binding pre-vote probe.
    pub pre_vote: bool,
}

/// RequestVote RPC results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself.
    pub term: u64,
    /// True means candidate received the (pre-)vote.
    pub vote_granted: bool,
    /// Echo of the request's pre-vote flag.
    pub pre_vote: bool,
}

/// AppendEntries RPC arguments (heartbeat when `entries` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term.
    pub term: u64,
    /// Leader's ID.
    pub leader_id: u64,
    /// Index of log entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub leader_commit: u64,
}

/// AppendEntries RPC results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself.
    pub term: u64,
    /// True if the follower accepted the entries.
    pub success: bool,
    /// On success, index of the last entry the follower now holds from this
    /// request (lets the leader keep pipeline bookkeeping exact).
    pub match_index: u64,
    /// On log-matching failure, the first index of the conflicting term, or
    /// the follower's `last_index + 1` when the follower's log is short.
    pub conflict_index: u64,
    /// Term of the conflicting entry, 0 when unknown.
    pub conflict_term: u64,
}

/// One chunk of an InstallSnapshot transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term.
    pub term: u64,
    /// Leader's ID.
    pub leader_id: u64,
    /// Last log index covered by the snapshot.
    pub last_included_index: u64,
    /// Term of the last included entry.
    pub last_included_term: u64,
    /// Configuration in force at the snapshot index.
    pub membership: Membership,
    /// Log index at which that configuration was appended.
    pub membership_index: u64,
    /// Byte offset of this chunk within the snapshot payload.
    pub offset: u64,
    /// Chunk data.
    pub data: Bytes,
    /// True on the terminal chunk.
    pub done: bool,
}

/// InstallSnapshot RPC results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// Chunk accepted (and, on the terminal chunk, snapshot installed).
    Success { term: u64 },
    /// Transfer rejected; the leader restarts it from offset 0.
    Failed { term: u64, reason: String },
}

/// TimeoutNow RPC: the leader asks the target to start an election
/// immediately, skipping pre-vote. Used for leadership transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowArgs {
    pub term: u64,
    pub leader_id: u64,
}

/// TimeoutNow RPC results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResult {
    pub term: u64,
}

/// Envelope over every message type, used by the wire codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVoteArgs),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshotArgs),
    InstallSnapshotResult(InstallSnapshotResult),
    TimeoutNow(TimeoutNowArgs),
    TimeoutNowResult(TimeoutNowResult),
}

impl Message {
    /// Stable one-byte discriminant used by the frame header.
    pub fn kind(&self) -> u8 {
        match self {
            Message::RequestVote(_) => 1,
            Message::RequestVoteResult(_) => 2,
            Message::AppendEntries(_) => 3,
            Message::AppendEntriesResult(_) => 4,
            Message::InstallSnapshot(_) => 5,
            Message::InstallSnapshotResult(_) => 6,
            Message::TimeoutNow(_) => 7,
            Message::TimeoutNowResult(_) => 8,
        }
    }
}
