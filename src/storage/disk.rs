//! Durable storage over a data directory.
//!
//! Owns the directory exclusively: rotated metadata files, preallocated
//! log segments written through the asynchronous writer, and atomically
//! persisted snapshots (`snapshot-TERM-INDEX-SUFFIX` plus a `.meta` file).

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, info, warn};

use super::metadata::{sync_dir, MetadataStore};
use super::segment::{decode_segment, encode_batch, encode_format_block, SegmentName};
use super::writer::{Capabilities, SegmentWriter};
use super::{InitialState, Storage, StorageError};
use crate::core::log::Entry;
use crate::core::snapshot::{Snapshot, SnapshotMeta};

/// Serialized form of a snapshot `.meta` file.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMetaFile {
    format: u64,
    meta: SnapshotMeta,
    /// CRC32 of the payload file.
    data_crc: u32,
}

const SNAPSHOT_META_FORMAT: u64 = 1;

#[derive(Debug, Clone)]
struct ClosedSegment {
    first: u64,
    last: u64,
    path: PathBuf,
}

#[derive(Debug)]
struct OpenSegment {
    writer: SegmentWriter,
    path: PathBuf,
    counter: u64,
    /// Indices covered so far; `None` until the first batch lands.
    range: Option<(u64, u64)>,
    /// Next write offset.
    offset: u64,
    size: u64,
}

/// Durable [`Storage`] implementation.
#[derive(Debug)]
pub struct DiskStorage {
    dir: PathBuf,
    caps: Capabilities,
    segment_size: u64,
    metadata: MetadataStore,
    closed: Vec<ClosedSegment>,
    open: Option<OpenSegment>,
    next_counter: u64,
    /// Last durably appended index (0 before anything is written).
    last_index: u64,
    errored: bool,
    closed_down: bool,
}

impl DiskStorage {
    /// Open (or create) a data directory. Capabilities are probed once
    /// here and drive the writer for the node's lifetime.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> Result<DiskStorage, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let caps = Capabilities::probe(&dir);
        info!(
            dir = %dir.display(),
            kaio = caps.kaio,
            direct_io = caps.direct_io,
            nowait = caps.nowait,
            block_size = caps.block_size,
            "opened data directory"
        );
        let metadata = MetadataStore::open(&dir)?;
        Ok(DiskStorage {
            dir,
            caps,
            segment_size,
            metadata,
            closed: Vec::new(),
            open: None,
            next_counter: 1,
            last_index: 0,
            errored: false,
            closed_down: false,
        })
    }

    fn check_usable(&self) -> Result<(), StorageError> {
        if self.closed_down {
            return Err(StorageError::Closed);
        }
        if self.errored {
            return Err(StorageError::Io("storage latched by an earlier error".into()));
        }
        Ok(())
    }

    fn latch<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if matches!(result, Err(StorageError::Io(_))) {
            self.errored = true;
        }
        result
    }

    // === boot-time scan ===

    /// Load the newest snapshot whose checksum verifies; older or damaged
    /// ones are skipped with a warning.
    fn scan_snapshots(&self) -> Result<Option<Snapshot>, StorageError> {
        let mut candidates: Vec<(u64, u64, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix("snapshot-") else { continue };
            let Some(rest) = rest.strip_suffix(".meta") else { continue };
            let mut parts = rest.splitn(3, '-');
            let (Some(term), Some(index)) = (parts.next(), parts.next()) else { continue };
            let (Ok(term), Ok(index)) = (term.parse::<u64>(), index.parse::<u64>()) else {
                continue;
            };
            candidates.push((index, term, dirent.path()));
        }
        candidates.sort_by(|a, b| b.cmp(a));

        for (index, term, meta_path) in candidates {
            match Self::read_snapshot(&meta_path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(index, term, error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn read_snapshot(meta_path: &Path) -> Result<Snapshot, StorageError> {
        let meta_bytes = fs::read(meta_path)?;
        let meta_file: SnapshotMetaFile = serde_json::from_slice(&meta_bytes)
            .map_err(|e| StorageError::Corrupt(format!("invalid snapshot metadata: {}", e)))?;
        if meta_file.format != SNAPSHOT_META_FORMAT {
            return Err(StorageError::Corrupt(format!(
                "unsupported snapshot format {}",
                meta_file.format
            )));
        }
        let data_path = meta_path.with_extension("");
        let data = fs::read(&data_path)?;
        if super::metadata::crc32(&data) != meta_file.data_crc {
            return Err(StorageError::Corrupt(format!(
                "snapshot payload checksum mismatch in {:?}",
                data_path
            )));
        }
        Ok(Snapshot { meta: meta_file.meta, data: Bytes::from(data) })
    }

    /// Scan and order the segment files on disk.
    fn scan_segments(&self) -> Result<(Vec<ClosedSegment>, Vec<(u64, PathBuf)>), StorageError> {
        let mut closed = Vec::new();
        let mut open = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            match SegmentName::parse(name) {
                Some(SegmentName::Closed { first, last }) => {
                    closed.push(ClosedSegment { first, last, path: dirent.path() });
                }
                Some(SegmentName::Open { counter }) => {
                    open.push((counter, dirent.path()));
                }
                None => {}
            }
        }
        closed.sort_by_key(|s| s.first);
        open.sort_by_key(|&(counter, _)| counter);
        Ok((closed, open))
    }

    fn read_closed_segment(&self, seg: &ClosedSegment) -> Result<Vec<Entry>, StorageError> {
        let data = fs::read(&seg.path)?;
        let contents = decode_segment(&data, self.caps.block_size, seg.first, true)?;
        let expected = (seg.last - seg.first + 1) as usize;
        if contents.entries.len() != expected {
            return Err(StorageError::Corrupt(format!(
                "segment {:?} holds {} entries, name promises {}",
                seg.path,
                contents.entries.len(),
                expected
            )));
        }
        Ok(contents.entries)
    }

    // === segment lifecycle ===

    async fn create_open_segment(&mut self, min_size: u64) -> Result<(), StorageError> {
        let counter = self.next_counter;
        self.next_counter += 1;
        let path = self.dir.join(SegmentName::Open { counter }.to_string());
        let size = self.segment_size.max(min_size);
        let writer = SegmentWriter::create(path.clone(), size, self.caps.clone()).await?;
        // The format block is the segment's first write.
        writer.write(encode_format_block(self.caps.block_size), 0).await?;
        debug!(segment = %path.display(), size, "created open segment");
        self.open = Some(OpenSegment {
            writer,
            path,
            counter,
            range: None,
            offset: self.caps.block_size as u64,
            size,
        });
        Ok(())
    }

    /// Close the current open segment, renaming it after the indices it
    /// covers (or deleting it when it never received a batch).
    async fn finish_open_segment(&mut self) -> Result<(), StorageError> {
        let Some(open) = self.open.take() else { return Ok(()) };
        open.writer.close().await?;
        match open.range {
            Some((first, last)) => {
                let closed_path =
                    self.dir.join(SegmentName::Closed { first, last }.to_string());
                fs::rename(&open.path, &closed_path)?;
                sync_dir(&self.dir)?;
                debug!(segment = %closed_path.display(), "finished segment");
                self.closed.push(ClosedSegment { first, last, path: closed_path });
            }
            None => {
                fs::remove_file(&open.path)?;
                sync_dir(&self.dir)?;
            }
        }
        Ok(())
    }

    async fn append_inner(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let first = entries[0].index;
        if self.open.is_none() && self.closed.is_empty() {
            // The log restarts here (fresh node, or everything was dropped
            // for an installed snapshot): record the new boundary so a
            // reload indexes the segment correctly.
            if self.metadata.record().first_index != first {
                let record = *self.metadata.record();
                self.metadata.save(record.term, record.voted_for, first)?;
            }
        } else {
            assert!(
                first == self.last_index + 1,
                "append must continue the durable log"
            );
        }

        let batch = encode_batch(entries, self.caps.block_size);
        if self.open.is_none() {
            self.create_open_segment(batch.len() as u64 + self.caps.block_size as u64).await?;
        } else if self.open.as_ref().unwrap().offset + batch.len() as u64
            > self.open.as_ref().unwrap().size
        {
            self.finish_open_segment().await?;
            self.create_open_segment(batch.len() as u64 + self.caps.block_size as u64).await?;
        }

        let open = self.open.as_mut().unwrap();
        let offset = open.offset;
        let batch_len = batch.len() as u64;
        open.writer.write(batch, offset).await?;
        open.offset += batch_len;
        let last = entries.last().unwrap().index;
        open.range = match open.range {
            Some((f, _)) => Some((f, last)),
            None => Some((first, last)),
        };
        self.last_index = last;
        Ok(())
    }

    async fn truncate_inner(&mut self, from_index: u64) -> Result<(), StorageError> {
        if from_index > self.last_index {
            return Ok(());
        }

        // Everything from `from_index` on lives in the open segment and/or
        // a suffix of the closed list. Collect the survivors of the one
        // segment that straddles the cut, drop whole segments past it, and
        // rewrite the survivors as a fresh open segment.
        let open = self.open.take();
        let mut retained: Vec<Entry> = Vec::new();

        if let Some(open) = open {
            open.writer.close().await?;
            if let Some((first, _)) = open.range {
                if first < from_index {
                    let data = fs::read(&open.path)?;
                    let contents = decode_segment(&data, self.caps.block_size, first, false)?;
                    retained = contents.entries;
                    retained.retain(|e| e.index < from_index);
                }
            }
            fs::remove_file(&open.path)?;
        }

        while let Some(seg) = self.closed.last() {
            if seg.first >= from_index {
                fs::remove_file(&seg.path)?;
                self.closed.pop();
            } else if seg.last >= from_index {
                let mut entries = self.read_closed_segment(seg)?;
                entries.retain(|e| e.index < from_index);
                fs::remove_file(&seg.path)?;
                let seg = self.closed.pop().unwrap();
                debug!(segment = %seg.path.display(), from_index, "rewrote straddling segment");
                entries.extend(retained);
                retained = entries;
            } else {
                break;
            }
        }
        sync_dir(&self.dir)?;

        self.last_index = from_index - 1;
        if !retained.is_empty() {
            let min_size =
                encode_batch(&retained, self.caps.block_size).len() as u64
                    + self.caps.block_size as u64;
            self.create_open_segment(min_size).await?;
            self.last_index = retained[0].index - 1;
            self.append_inner(&retained).await?;
        }
        Ok(())
    }

    async fn compact_inner(&mut self, through_index: u64) -> Result<(), StorageError> {
        let removable: Vec<ClosedSegment> = self
            .closed
            .iter()
            .filter(|s| s.last <= through_index)
            .cloned()
            .collect();
        if removable.is_empty() {
            return Ok(());
        }
        self.closed.retain(|s| s.last > through_index);

        // Record the new boundary before deleting files, so a crash in
        // between leaves stale-but-harmless segments rather than a gap.
        let first_index = self
            .closed
            .first()
            .map(|s| s.first)
            .or_else(|| self.open.as_ref().and_then(|o| o.range.map(|(f, _)| f)))
            .unwrap_or(through_index + 1);
        let record = *self.metadata.record();
        self.metadata.save(record.term, record.voted_for, first_index)?;

        for seg in removable {
            fs::remove_file(&seg.path)?;
            debug!(segment = %seg.path.display(), "deleted compacted segment");
        }
        sync_dir(&self.dir)?;
        Ok(())
    }

    async fn save_snapshot_inner(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let suffix: u32 = rand::random();
        let base = format!(
            "snapshot-{}-{}-{:08x}",
            snapshot.meta.last_included_term, snapshot.meta.last_included_index, suffix
        );
        let dir = self.dir.clone();
        let data = snapshot.data.clone();
        let meta_file = SnapshotMetaFile {
            format: SNAPSHOT_META_FORMAT,
            meta: snapshot.meta.clone(),
            data_crc: super::metadata::crc32(&data),
        };

        task::spawn_blocking(move || -> Result<(), StorageError> {
            let data_path = dir.join(&base);
            let meta_path = dir.join(format!("{}.meta", base));

            // Payload first; the .meta rename is the commit point.
            let tmp = data_path.with_extension("tmp");
            fs::write(&tmp, &data)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &data_path)?;

            let meta_bytes = serde_json::to_vec(&meta_file)
                .map_err(|e| StorageError::Io(format!("snapshot metadata encoding: {}", e)))?;
            let tmp = meta_path.with_extension("tmp");
            fs::write(&tmp, &meta_bytes)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &meta_path)?;

            sync_dir(&dir)?;

            // Drop superseded snapshot pairs.
            for dirent in fs::read_dir(&dir)? {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with("snapshot-") && !name.starts_with(base.as_str()) {
                    let _ = fs::remove_file(dirent.path());
                }
            }
            sync_dir(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(format!("snapshot task failed: {}", e)))??;

        info!(
            index = snapshot.meta.last_included_index,
            term = snapshot.meta.last_included_term,
            bytes = snapshot.data.len(),
            "persisted snapshot"
        );
        Ok(())
    }
}

#[async_trait]
impl Storage for DiskStorage {
    fn load(&mut self) -> Result<InitialState, StorageError> {
        let record = *self.metadata.record();
        let snapshot = self.scan_snapshots()?;
        let (closed, open) = self.scan_segments()?;

        let mut entries: Vec<Entry> = Vec::new();
        let mut first_index = record.first_index;
        for seg in &closed {
            if seg.last < record.first_index {
                // Left behind by a compaction that crashed before deleting.
                fs::remove_file(&seg.path)?;
                continue;
            }
            let mut segment_entries = self.read_closed_segment(seg)?;
            if let Some(last) = entries.last() {
                if seg.first != last.index + 1 {
                    return Err(StorageError::Corrupt(format!(
                        "segment {:?} does not continue the log at {}",
                        seg.path,
                        last.index + 1
                    )));
                }
            } else {
                first_index = seg.first;
            }
            entries.append(&mut segment_entries);
            self.closed.push(seg.clone());
        }

        // Open segments left by a previous run: recover their tail and
        // finish them; appends start a fresh segment.
        for (counter, path) in open {
            self.next_counter = self.next_counter.max(counter + 1);
            let next_index = entries.last().map(|e| e.index + 1).unwrap_or(record.first_index);
            let data = fs::read(&path)?;
            let contents = decode_segment(&data, self.caps.block_size, next_index, false)?;
            if contents.entries.is_empty() {
                fs::remove_file(&path)?;
                continue;
            }
            let first = contents.entries[0].index;
            let last = contents.entries.last().unwrap().index;
            let closed_path = self.dir.join(SegmentName::Closed { first, last }.to_string());
            fs::rename(&path, &closed_path)?;
            if entries.is_empty() {
                first_index = first;
            }
            entries.extend(contents.entries);
            self.closed.push(ClosedSegment { first, last, path: closed_path });
        }
        sync_dir(&self.dir)?;

        match &snapshot {
            Some(snap) => {
                let snap_index = snap.meta.last_included_index;
                if entries.last().map(|e| e.index).unwrap_or(0) < snap_index {
                    // The log lags the snapshot (installed from a peer and
                    // interrupted before compaction finished); the surviving
                    // segments cannot serve as its suffix, drop them.
                    if !entries.is_empty() {
                        warn!(
                            log_last = entries.last().unwrap().index,
                            snapshot = snap_index,
                            "discarding log left behind by an installed snapshot"
                        );
                    }
                    entries.clear();
                    for seg in self.closed.drain(..) {
                        fs::remove_file(&seg.path)?;
                    }
                    sync_dir(&self.dir)?;
                    first_index = snap_index + 1;
                    self.metadata.save(record.term, record.voted_for, first_index)?;
                } else if !entries.is_empty() && first_index > snap_index + 1 {
                    return Err(StorageError::Corrupt(format!(
                        "log starts at {} leaving a gap after snapshot index {}",
                        first_index, snap_index
                    )));
                }
            }
            None => {
                if first_index > 1 {
                    return Err(StorageError::Corrupt(format!(
                        "log starts at {} but no snapshot covers the prefix",
                        first_index
                    )));
                }
            }
        }

        self.last_index = entries.last().map(|e| e.index).unwrap_or_else(|| {
            snapshot.as_ref().map(|s| s.meta.last_included_index).unwrap_or(0)
        });

        if entries.is_empty() {
            first_index = snapshot
                .as_ref()
                .map(|s| s.meta.last_included_index + 1)
                .unwrap_or(1);
        }

        info!(
            term = record.term,
            voted_for = ?record.voted_for,
            first_index,
            last_index = self.last_index,
            has_snapshot = snapshot.is_some(),
            "loaded persistent state"
        );
        Ok(InitialState {
            term: record.term,
            voted_for: record.voted_for,
            first_index,
            entries,
            snapshot,
        })
    }

    async fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.check_usable()?;
        let first_index = self.metadata.record().first_index;
        let result = self.metadata.save(term, voted_for, first_index);
        self.latch(result)
    }

    async fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.check_usable()?;
        let result = self.append_inner(entries).await;
        self.latch(result)
    }

    async fn truncate(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.check_usable()?;
        let result = self.truncate_inner(from_index).await;
        self.latch(result)
    }

    async fn compact(&mut self, through_index: u64) -> Result<(), StorageError> {
        self.check_usable()?;
        let result = self.compact_inner(through_index).await;
        self.latch(result)
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.check_usable()?;
        let result = self.save_snapshot_inner(snapshot).await;
        self.latch(result)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.scan_snapshots()
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if self.closed_down {
            return Ok(());
        }
        self.closed_down = true;
        if let Some(open) = self.open.take() {
            // Drain in-flight writes; the open-N file is recovered on the
            // next boot.
            open.writer.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::EntryKind;
    use crate::core::membership::Membership;
    use tempfile::TempDir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::command(term, i, Bytes::from(format!("op-{i}")))).collect()
    }

    #[tokio::test]
    async fn append_then_reload_reconstructs_the_log() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
            storage.load().unwrap();
            storage.append(&entries(1..=3, 1)).await.unwrap();
            storage.append(&entries(4..=6, 2)).await.unwrap();
            storage.close().await.unwrap();
        }

        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.first_index, 1);
        assert_eq!(state.entries.len(), 6);
        assert_eq!(state.entries[3].term, 2);
        assert_eq!(state.entries[5].index, 6);
        assert_eq!(&state.entries[0].payload[..], b"op-1");
    }

    #[tokio::test]
    async fn vote_survives_restart_without_reverting() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
            storage.load().unwrap();
            storage.save_vote(7, Some(1)).await.unwrap();
            storage.close().await.unwrap();
        }
        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.term, 7);
        assert_eq!(state.voted_for, Some(1));
    }

    #[tokio::test]
    async fn truncate_discards_conflicting_suffix() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
            storage.load().unwrap();
            storage.append(&entries(1..=5, 1)).await.unwrap();
            storage.truncate(4).await.unwrap();
            storage.append(&entries(4..=4, 3)).await.unwrap();
            storage.close().await.unwrap();
        }
        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.entries.len(), 4);
        assert_eq!(state.entries[3].index, 4);
        assert_eq!(state.entries[3].term, 3);
    }

    #[tokio::test]
    async fn segments_roll_when_full() {
        let dir = TempDir::new().unwrap();
        // Tiny segments force a roll every couple of batches.
        let mut storage = DiskStorage::open(dir.path(), 3 * 4096).unwrap();
        storage.load().unwrap();
        for start in (1..=40).step_by(4) {
            storage.append(&entries(start..=start + 3, 1)).await.unwrap();
        }
        storage.close().await.unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|d| d.unwrap().file_name().to_str().map(String::from))
            .filter(|n| SegmentName::parse(n).is_some())
            .collect();
        assert!(names.len() > 1, "expected several segments, got {:?}", names);

        let mut storage = DiskStorage::open(dir.path(), 3 * 4096).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.entries.len(), 40);
        assert_eq!(state.entries.last().unwrap().index, 40);
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_compaction() {
        let dir = TempDir::new().unwrap();
        let mut storage = DiskStorage::open(dir.path(), 2 * 4096).unwrap();
        storage.load().unwrap();
        for start in (1..=20).step_by(4) {
            storage.append(&entries(start..=start + 3, 1)).await.unwrap();
        }

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: 12,
                last_included_term: 1,
                membership: Membership::bootstrap(1, "addr".into()),
                membership_index: 1,
            },
            data: Bytes::from_static(b"fsm-state"),
        };
        storage.save_snapshot(&snapshot).await.unwrap();
        storage.compact(12).await.unwrap();
        storage.close().await.unwrap();

        let mut storage = DiskStorage::open(dir.path(), 2 * 4096).unwrap();
        let state = storage.load().unwrap();
        let snap = state.snapshot.expect("snapshot must reload");
        assert_eq!(snap.meta.last_included_index, 12);
        assert_eq!(&snap.data[..], b"fsm-state");
        // The suffix past the compaction point is still there and contiguous.
        assert!(!state.entries.is_empty());
        assert_eq!(state.entries.last().unwrap().index, 20);
        let first = state.entries[0].index;
        assert_eq!(state.first_index, first);
        for (i, e) in state.entries.iter().enumerate() {
            assert_eq!(e.index, first + i as u64);
        }
    }

    #[tokio::test]
    async fn snapshot_with_no_live_entries_defines_first_index() {
        let dir = TempDir::new().unwrap();
        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        storage.load().unwrap();
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: 30,
                last_included_term: 2,
                membership: Membership::bootstrap(1, "addr".into()),
                membership_index: 1,
            },
            data: Bytes::from_static(b"s"),
        };
        storage.save_snapshot(&snapshot).await.unwrap();
        storage.close().await.unwrap();

        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        let state = storage.load().unwrap();
        assert!(state.entries.is_empty());
        assert_eq!(state.first_index, 31);
    }

    #[tokio::test]
    async fn configuration_entries_survive_reload() {
        let dir = TempDir::new().unwrap();
        let membership = Membership::bootstrap(1, "addr".into());
        {
            let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
            storage.load().unwrap();
            storage
                .append(&[Entry::configuration(1, 1, membership.encode())])
                .await
                .unwrap();
            storage.close().await.unwrap();
        }
        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.entries[0].kind, EntryKind::Configuration);
        assert_eq!(Membership::decode(&state.entries[0].payload).unwrap(), membership);
    }

    #[tokio::test]
    async fn closed_storage_rejects_submissions() {
        let dir = TempDir::new().unwrap();
        let mut storage = DiskStorage::open(dir.path(), 1 << 20).unwrap();
        storage.load().unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.append(&entries(1..=1, 1)).await,
            Err(StorageError::Closed)
        ));
    }
}
