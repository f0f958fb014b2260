//! Storage abstraction for Raft persistent state.
//!
//! Raft requires certain state to be durable before the node responds to
//! RPCs: the current term, the vote, and log entries. Mutating operations
//! are asynchronous; they resolve once the bytes are on stable storage, in
//! submission order.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::log::Entry;
use crate::core::snapshot::Snapshot;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g. disk full, permission denied). Latches the node
    /// unavailable.
    #[error("i/o error: {0}")]
    Io(String),
    /// On-disk data failed a checksum or version check; the node refuses
    /// to start.
    #[error("data corruption: {0}")]
    Corrupt(String),
    /// The storage has been closed; no further submissions are accepted.
    #[error("storage is closed")]
    Closed,
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Persistent state handed back at boot.
#[derive(Debug)]
pub struct InitialState {
    pub term: u64,
    pub voted_for: Option<u64>,
    /// First log index still held in storage (the compaction boundary).
    /// May trail the snapshot index when trailing entries are retained.
    pub first_index: u64,
    /// Log suffix surviving on disk: contiguous, ascending, starting at
    /// `first_index`.
    pub entries: Vec<Entry>,
    /// Latest valid snapshot, if any.
    pub snapshot: Option<Snapshot>,
}

/// Storage trait for Raft persistent state.
///
/// A single writer owns the backing directory. After any method returns
/// `StorageError::Io` the implementation is latched: every later
/// submission fails fast until a fresh storage is built.
#[async_trait]
pub trait Storage: Send {
    /// Load persistent state. Called once at boot, before the node runs.
    fn load(&mut self) -> Result<InitialState, StorageError>;

    /// Durably record the current term and vote. Must complete before any
    /// message that depends on them is sent.
    async fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Durably append entries at the log tail. Batches complete in
    /// submission order.
    async fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Remove entries with `index >= from_index` (conflict resolution).
    async fn truncate(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// Drop entries with `index <= through_index` after a snapshot commits.
    /// Implementations may retain more (whole-segment granularity).
    async fn compact(&mut self, through_index: u64) -> Result<(), StorageError>;

    /// Atomically persist a snapshot.
    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the latest snapshot (used when a peer must be caught up).
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Drain in-flight writes and release resources. No submissions are
    /// accepted afterwards.
    async fn close(&mut self) -> Result<(), StorageError>;
}
