//! Raft configuration parameters.

use std::time::Duration;

/// Configuration for Raft timing and sizing parameters.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout; actual timeouts are drawn uniformly from
    /// `[election_timeout, 2 * election_timeout)` (default: 1000ms).
    pub election_timeout: Duration,
    /// Interval between heartbeats sent by the leader (default: 100ms).
    pub heartbeat_interval: Duration,
    /// Applied entries since the last snapshot before an automatic snapshot
    /// is taken (default: 1024). 0 disables automatic snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind a snapshot so slow followers can still
    /// be served by AppendEntries (default: 8192).
    pub trailing_entries: u64,
    /// Size of one InstallSnapshot chunk in bytes (default: 1 MiB).
    pub snapshot_chunk_size: usize,
    /// A follower drops a half-finished snapshot install when the gap
    /// between chunks exceeds this (default: 30s).
    pub snapshot_chunk_timeout: Duration,
    /// Unacknowledged AppendEntries allowed in flight per peer (default: 4).
    pub max_inflight_appends: usize,
    /// Entries per AppendEntries batch (default: 64).
    pub max_batch_entries: u64,
    /// Preallocated size of one log segment file (default: 8 MiB).
    pub segment_size: u64,
    /// Leader steps down when it has heard from fewer than a quorum of
    /// voters within a full election timeout (default: true).
    pub check_quorum: bool,
    /// Catch-up rounds allowed before a promotion times out (default: 10).
    pub max_catch_up_rounds: u32,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(100),
            snapshot_threshold: 1024,
            trailing_entries: 8192,
            snapshot_chunk_size: 1024 * 1024,
            snapshot_chunk_timeout: Duration::from_secs(30),
            max_inflight_appends: 4,
            max_batch_entries: 64,
            segment_size: 8 * 1024 * 1024,
            check_quorum: true,
            max_catch_up_rounds: 10,
        }
    }
}

impl RaftConfig {
    /// Create a new config with a custom heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with a custom base election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Create a new config with a custom snapshot threshold.
    /// Set to 0 to disable automatic snapshots.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Create a new config with a custom trailing-entry count.
    pub fn with_trailing_entries(mut self, trailing: u64) -> Self {
        self.trailing_entries = trailing;
        self
    }

    /// Generate a randomised election timeout in
    /// `[election_timeout, 2 * election_timeout)`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let base = self.election_timeout.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(base..base * 2);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_timeout_stays_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= config.election_timeout);
            assert!(t < config.election_timeout * 2);
        }
    }
}
