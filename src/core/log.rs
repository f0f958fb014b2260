//! In-memory log store: a contiguous window over the durable log.
//!
//! The store holds entries in `[snapshot_last_index + 1, last_index]`.
//! Entries below the window live only in the snapshot; the boundary term
//! is kept so log-matching checks work at the edge.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Opaque command for the user state machine.
    Command,
    /// Encoded server set; applied to the configuration at append time.
    Configuration,
    /// Empty entry a new leader appends to commit prior-term entries.
    Barrier,
}

/// A single log entry. Immutable once durably appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Term when the entry was received by the leader.
    pub term: u64,
    /// Position in the log (1-indexed).
    pub index: u64,
    pub kind: EntryKind,
    /// Opaque bytes; configuration entries carry the encoded server set.
    pub payload: Bytes,
}

impl Entry {
    pub fn command(term: u64, index: u64, payload: Bytes) -> Self {
        Entry { term, index, kind: EntryKind::Command, payload }
    }

    pub fn barrier(term: u64, index: u64) -> Self {
        Entry { term, index, kind: EntryKind::Barrier, payload: Bytes::new() }
    }

    pub fn configuration(term: u64, index: u64, payload: Bytes) -> Self {
        Entry { term, index, kind: EntryKind::Configuration, payload }
    }
}

/// A pinned range, protecting entries from compaction while a replication
/// batch referencing them is in flight.
#[derive(Debug)]
struct Pin {
    id: u64,
    lo: u64,
    hi: u64,
}

/// Volatile index over the durable entries.
#[derive(Debug)]
pub struct LogStore {
    entries: VecDeque<Entry>,
    /// Index of the last entry below the window (snapshot boundary; 0 for a
    /// log that starts at index 1).
    offset: u64,
    /// Term of the entry at `offset`.
    offset_term: u64,
    pins: Vec<Pin>,
    next_pin: u64,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    pub fn new() -> Self {
        LogStore { entries: VecDeque::new(), offset: 0, offset_term: 0, pins: Vec::new(), next_pin: 1 }
    }

    /// Rebuild the store from loaded state: the snapshot boundary plus the
    /// surviving entry suffix (which must be contiguous from `offset + 1`).
    pub fn restore(offset: u64, offset_term: u64, entries: Vec<Entry>) -> Self {
        if let Some(first) = entries.first() {
            assert_eq!(first.index, offset + 1, "log suffix must start at the window base");
        }
        LogStore {
            entries: entries.into(),
            offset,
            offset_term,
            pins: Vec::new(),
            next_pin: 1,
        }
    }

    /// Index of the last entry covered by the snapshot (0 if none).
    pub fn snapshot_index(&self) -> u64 {
        self.offset
    }

    /// Term of the last entry covered by the snapshot.
    pub fn snapshot_term(&self) -> u64 {
        self.offset_term
    }

    /// First index held in memory.
    pub fn first_index(&self) -> u64 {
        self.offset + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(self.offset)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.offset_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.offset || index > self.last_index() {
            None
        } else {
            Some((index - self.offset - 1) as usize)
        }
    }

    /// Entry at `index`, or `None` if it is compacted away or beyond the end.
    pub fn get(&self, index: u64) -> Option<&Entry> {
        self.position(index).and_then(|pos| self.entries.get(pos))
    }

    /// Term of the entry at `index`; answers from the snapshot boundary for
    /// `index == snapshot_index`.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == self.offset {
            Some(self.offset_term)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    /// Clone of the entries in `[lo, hi]`, clipped to the window. Payloads
    /// are reference-counted, so this is cheap.
    pub fn range(&self, lo: u64, hi: u64) -> Vec<Entry> {
        let lo = lo.max(self.first_index());
        let hi = hi.min(self.last_index());
        if lo > hi {
            return Vec::new();
        }
        let start = (lo - self.offset - 1) as usize;
        let end = (hi - self.offset) as usize;
        self.entries.iter().skip(start).take(end - start).cloned().collect()
    }

    /// Append entries at the tail. Indices must continue the log densely;
    /// appending across a term boundary is permitted.
    pub fn append(&mut self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            assert_eq!(
                entry.index,
                self.last_index() + 1,
                "log indices must be dense"
            );
            self.entries.push_back(entry);
        }
    }

    /// Remove all entries with `index >= from_index`, returning them (the
    /// caller inspects the removed suffix for configuration rollback).
    pub fn truncate_suffix(&mut self, from_index: u64) -> Vec<Entry> {
        match self.position(from_index) {
            Some(pos) => self.entries.split_off(pos).into(),
            None => Vec::new(),
        }
    }

    /// Drop entries with `index <= through_index` after a snapshot commits.
    /// Fails with `Busy` while any pinned range overlaps the dropped prefix.
    pub fn truncate_prefix(&mut self, through_index: u64) -> Result<(), RaftError> {
        let through = through_index.min(self.last_index());
        if through <= self.offset {
            return Ok(());
        }
        if self.pins.iter().any(|p| p.lo <= through) {
            return Err(RaftError::Busy);
        }
        let new_offset_term = self
            .term_of(through)
            .expect("prefix truncation point must be inside the window");
        while self.entries.front().is_some_and(|e| e.index <= through) {
            self.entries.pop_front();
        }
        self.offset = through;
        self.offset_term = new_offset_term;
        Ok(())
    }

    /// Discard everything and restart the window at a snapshot boundary
    /// (used when installing a snapshot ahead of the local log).
    pub fn reset(&mut self, offset: u64, offset_term: u64) {
        self.entries.clear();
        self.pins.clear();
        self.offset = offset;
        self.offset_term = offset_term;
    }

    /// Pin `[lo, hi]` against compaction while a replication batch is in
    /// flight. Returns a pin id to pass to [`LogStore::release`].
    pub fn acquire(&mut self, lo: u64, hi: u64) -> u64 {
        let id = self.next_pin;
        self.next_pin += 1;
        self.pins.push(Pin { id, lo, hi });
        id
    }

    /// Release a pin taken with [`LogStore::acquire`].
    pub fn release(&mut self, pin: u64) {
        self.pins.retain(|p| p.id != pin);
    }
}
