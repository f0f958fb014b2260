//! Snapshot types for log compaction.
//!
//! Snapshots capture the state machine at a specific log index together
//! with the configuration in force there, allowing older log entries to be
//! discarded.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::membership::Membership;

/// Metadata about what a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log index included in this snapshot.
    pub last_included_index: u64,
    /// Term of the last included log entry.
    pub last_included_term: u64,
    /// Configuration in force at `last_included_index`.
    pub membership: Membership,
    /// Log index at which that configuration was appended.
    pub membership_index: u64,
}

/// A snapshot of the state machine at a specific point in the log.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// Serialized state machine data.
    pub data: Bytes,
}

/// Follower-side accumulation state for a chunked InstallSnapshot transfer.
#[derive(Debug)]
pub struct PendingInstall {
    pub meta: SnapshotMeta,
    buf: BytesMut,
    /// Instant the last chunk arrived, for the chunk timeout.
    pub last_chunk: Instant,
}

impl PendingInstall {
    pub fn new(meta: SnapshotMeta) -> Self {
        PendingInstall { meta, buf: BytesMut::new(), last_chunk: Instant::now() }
    }

    /// Byte offset the next chunk must carry.
    pub fn next_offset(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Accept the next chunk. Rejects chunks that do not continue exactly at
    /// the accumulated offset (the leader restarts the transfer instead).
    pub fn accept(&mut self, offset: u64, data: &[u8]) -> Result<(), String> {
        if offset != self.next_offset() {
            return Err(format!(
                "snapshot chunk at offset {} does not continue transfer at {}",
                offset,
                self.next_offset()
            ));
        }
        self.buf.extend_from_slice(data);
        self.last_chunk = Instant::now();
        Ok(())
    }

    /// Seal the transfer into a complete snapshot.
    pub fn finish(self) -> Snapshot {
        Snapshot { meta: self.meta, data: self.buf.freeze() }
    }
}
