//! In-memory storage implementation for testing.
//!
//! Keeps everything in process memory. Completion semantics mirror the
//! disk implementation (operations resolve "durable" in submission order),
//! so the consensus paths exercise the same await points.

use async_trait::async_trait;

use super::{InitialState, Storage, StorageError};
use crate::core::log::Entry;
use crate::core::snapshot::Snapshot;

/// Storage that persists nothing across process restarts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    term: u64,
    voted_for: Option<u64>,
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
    closed: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Entries currently held (test inspection).
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn load(&mut self) -> Result<InitialState, StorageError> {
        let first_index = self.entries.first().map(|e| e.index).unwrap_or_else(|| {
            self.snapshot
                .as_ref()
                .map(|s| s.meta.last_included_index + 1)
                .unwrap_or(1)
        });
        Ok(InitialState {
            term: self.term,
            voted_for: self.voted_for,
            first_index,
            entries: self.entries.clone(),
            snapshot: self.snapshot.clone(),
        })
    }

    async fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.check_open()?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    async fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.check_open()?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.entries.retain(|e| e.index < from_index);
        Ok(())
    }

    async fn compact(&mut self, through_index: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.entries.retain(|e| e.index > through_index);
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.check_open()?;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn append_truncate_compact() {
        let mut storage = MemoryStorage::new();
        let entries: Vec<Entry> =
            (1..=5).map(|i| Entry::command(1, i, Bytes::from_static(b"x"))).collect();
        storage.append(&entries).await.unwrap();
        storage.truncate(4).await.unwrap();
        assert_eq!(storage.entries().last().unwrap().index, 3);
        storage.compact(1).await.unwrap();
        assert_eq!(storage.entries().first().unwrap().index, 2);
    }

    #[tokio::test]
    async fn closed_storage_fails_fast() {
        let mut storage = MemoryStorage::new();
        storage.close().await.unwrap();
        let err = storage.save_vote(1, None).await.unwrap_err();
        assert_eq!(err, StorageError::Closed);
    }
}
