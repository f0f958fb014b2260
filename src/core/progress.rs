//! Leader-side replication state, one record per peer.

use bytes::Bytes;
use tokio::time::Instant;

use crate::core::snapshot::SnapshotMeta;

/// An in-flight snapshot transfer towards one peer. The payload is loaded
/// once and chunked from memory.
#[derive(Debug, Clone)]
pub struct SnapshotTransfer {
    pub meta: SnapshotMeta,
    pub data: Bytes,
    /// Offset of the next chunk to send.
    pub offset: u64,
    pub started: Instant,
}

impl SnapshotTransfer {
    pub fn done(&self) -> bool {
        self.offset >= self.data.len() as u64
    }
}

/// Per-peer volatile replication state, reset on every election.
#[derive(Debug)]
pub struct Progress {
    /// Index of the next log entry to send to the peer.
    pub next_index: u64,
    /// Highest log index known replicated on the peer.
    pub match_index: u64,
    /// Unacknowledged AppendEntries currently in flight.
    pub inflight: usize,
    /// Last time the peer acknowledged any RPC. Starts at the election
    /// instant so check-quorum grants a full timeout of grace.
    pub last_contact: Option<Instant>,
    /// Set while the peer is being caught up via InstallSnapshot.
    pub snapshot: Option<SnapshotTransfer>,
}

impl Progress {
    pub fn new(last_log_index: u64) -> Self {
        Progress {
            next_index: last_log_index + 1,
            match_index: 0,
            inflight: 0,
            last_contact: Some(Instant::now()),
            snapshot: None,
        }
    }

    /// Whether another append may be pipelined to this peer.
    pub fn can_send(&self, max_inflight: usize) -> bool {
        self.snapshot.is_none() && self.inflight < max_inflight
    }

    /// Record a successful append acknowledgement up to `index`.
    pub fn on_success(&mut self, index: u64) {
        if index > self.match_index {
            self.match_index = index;
        }
        if index + 1 > self.next_index {
            self.next_index = index + 1;
        }
        self.last_contact = Some(Instant::now());
    }

    /// Back off `next_index` using the follower's conflict hint: the first
    /// index of the conflicting term, or the follower's `last_index + 1`.
    pub fn on_conflict(&mut self, conflict_index: u64) {
        let hint = conflict_index.max(self.match_index + 1);
        if hint < self.next_index {
            self.next_index = hint;
        } else if self.next_index > self.match_index + 1 {
            // Hint did not help; fall back to stepping one back.
            self.next_index -= 1;
        }
        self.last_contact = Some(Instant::now());
    }
}

/// Leader-side bookkeeping for a promotion in progress: the target must
/// catch up within a bounded number of replication rounds before the
/// promotion entry is appended.
#[derive(Debug)]
pub struct CatchUp {
    /// Server being promoted.
    pub id: u64,
    /// Rounds completed so far.
    pub rounds: u32,
    /// Start of the current round.
    pub round_start: Instant,
    /// The round ends when the target's `match_index` reaches this.
    pub round_target: u64,
}

impl CatchUp {
    pub fn new(id: u64, round_target: u64) -> Self {
        CatchUp { id, rounds: 0, round_start: Instant::now(), round_target }
    }

    /// Begin the next round towards a new target index.
    pub fn next_round(&mut self, round_target: u64) {
        self.rounds += 1;
        self.round_start = Instant::now();
        self.round_target = round_target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_advances_match_and_next() {
        let mut p = Progress::new(10);
        assert_eq!(p.next_index, 11);
        p.on_success(11);
        assert_eq!(p.match_index, 11);
        assert_eq!(p.next_index, 12);
        // Stale acknowledgements never move state backwards.
        p.on_success(5);
        assert_eq!(p.match_index, 11);
        assert_eq!(p.next_index, 12);
    }

    #[test]
    fn conflict_hint_backtracks_next_index() {
        let mut p = Progress::new(20);
        p.on_conflict(7);
        assert_eq!(p.next_index, 7);
        // A useless hint still makes progress by stepping back one.
        let mut q = Progress::new(20);
        q.on_conflict(25);
        assert_eq!(q.next_index, 20);
    }

    #[test]
    fn conflict_never_backtracks_below_match() {
        let mut p = Progress::new(20);
        p.on_success(15);
        p.on_conflict(3);
        assert_eq!(p.next_index, 16);
    }

    #[test]
    fn pipeline_bound_is_respected() {
        let mut p = Progress::new(0);
        assert!(p.can_send(2));
        p.inflight = 2;
        assert!(!p.can_send(2));
        p.inflight = 1;
        p.snapshot = Some(SnapshotTransfer {
            meta: SnapshotMeta {
                last_included_index: 1,
                last_included_term: 1,
                membership: crate::core::membership::Membership::new(),
                membership_index: 0,
            },
            data: Bytes::from_static(b"s"),
            offset: 0,
            started: Instant::now(),
        });
        assert!(!p.can_send(2));
    }
}
