//! On-disk log segment format.
//!
//! A segment is a preallocated file holding a contiguous run of entries.
//! While being written it is named `open-N` (monotonic counter N); once
//! finished it is renamed to `first-last` after the indices it covers.
//!
//! Layout: the first block carries the format word; every batch that
//! follows starts on a block boundary and is zero-padded to one, so writes
//! stay aligned for direct I/O and a crash can only ever produce a torn
//! *tail*. A batch is
//!
//! ```text
//! u32 crc(header) | u32 crc(payloads) | u32 count | u32 0
//! count * { u64 term | u32 kind | u32 len }
//! payloads, zero padding to the block boundary
//! ```
//!
//! Entry indices are not stored; they are derived from the segment's first
//! index and position, the way the file name records them.

use std::fmt;

use bytes::Bytes;

use super::metadata::crc32;
use super::StorageError;
use crate::core::log::{Entry, EntryKind};

/// Format word written in the first block of every segment.
pub const SEGMENT_FORMAT: u64 = 1;

const BATCH_HEADER_LEN: usize = 16;
const ENTRY_HEADER_LEN: usize = 16;

/// Parsed segment file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentName {
    /// `open-N`: currently being written.
    Open { counter: u64 },
    /// `first-last`: finished, covering `[first, last]`.
    Closed { first: u64, last: u64 },
}

impl SegmentName {
    pub fn parse(name: &str) -> Option<SegmentName> {
        if let Some(counter) = name.strip_prefix("open-") {
            return counter.parse().ok().map(|counter| SegmentName::Open { counter });
        }
        let (first, last) = name.split_once('-')?;
        let first: u64 = first.parse().ok()?;
        let last: u64 = last.parse().ok()?;
        (first >= 1 && last >= first).then_some(SegmentName::Closed { first, last })
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentName::Open { counter } => write!(f, "open-{}", counter),
            SegmentName::Closed { first, last } => write!(f, "{}-{}", first, last),
        }
    }
}

fn kind_code(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Command => 1,
        EntryKind::Configuration => 2,
        EntryKind::Barrier => 3,
    }
}

fn kind_from_code(code: u32) -> Result<EntryKind, StorageError> {
    match code {
        1 => Ok(EntryKind::Command),
        2 => Ok(EntryKind::Configuration),
        3 => Ok(EntryKind::Barrier),
        other => Err(StorageError::Corrupt(format!("unknown entry kind {}", other))),
    }
}

fn pad_to_block(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size) * block_size
}

/// The format block written at offset 0 of a new segment.
pub fn encode_format_block(block_size: usize) -> Vec<u8> {
    let mut block = vec![0u8; block_size];
    block[0..8].copy_from_slice(&SEGMENT_FORMAT.to_le_bytes());
    block
}

/// Encode one batch of contiguous entries, zero-padded to the block size.
pub fn encode_batch(entries: &[Entry], block_size: usize) -> Vec<u8> {
    assert!(!entries.is_empty(), "batches carry at least one entry");
    let headers_len = entries.len() * ENTRY_HEADER_LEN;
    let payload_len: usize = entries.iter().map(|e| e.payload.len()).sum();
    let raw_len = BATCH_HEADER_LEN + headers_len + payload_len;
    let mut buf = vec![0u8; pad_to_block(raw_len, block_size)];

    buf[8..12].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    let mut at = BATCH_HEADER_LEN;
    for entry in entries {
        buf[at..at + 8].copy_from_slice(&entry.term.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&kind_code(entry.kind).to_le_bytes());
        buf[at + 12..at + 16].copy_from_slice(&(entry.payload.len() as u32).to_le_bytes());
        at += ENTRY_HEADER_LEN;
    }
    for entry in entries {
        buf[at..at + entry.payload.len()].copy_from_slice(&entry.payload);
        at += entry.payload.len();
    }

    let crc_header = crc32(&buf[8..BATCH_HEADER_LEN + headers_len]);
    let crc_data = crc32(&buf[BATCH_HEADER_LEN + headers_len..raw_len]);
    buf[0..4].copy_from_slice(&crc_header.to_le_bytes());
    buf[4..8].copy_from_slice(&crc_data.to_le_bytes());
    buf
}

/// Result of scanning a segment's contents.
#[derive(Debug)]
pub struct SegmentContents {
    pub entries: Vec<Entry>,
    /// Bytes consumed, including the format block; the next batch in an
    /// open segment continues at this offset.
    pub used: u64,
}

/// Decode a whole segment image. Entry indices are assigned sequentially
/// starting at `first_index`. Scanning stops at the preallocated zero tail
/// or, for an open segment (`strict == false`), at the first torn batch;
/// a closed segment (`strict == true`) must parse fully.
pub fn decode_segment(
    data: &[u8],
    block_size: usize,
    first_index: u64,
    strict: bool,
) -> Result<SegmentContents, StorageError> {
    if data.len() < block_size {
        return Err(StorageError::Corrupt("segment shorter than one block".into()));
    }
    let format = u64::from_le_bytes(data[0..8].try_into().unwrap());
    if format != SEGMENT_FORMAT {
        return Err(StorageError::Corrupt(format!("unsupported segment format {}", format)));
    }

    let mut entries = Vec::new();
    let mut next_index = first_index;
    let mut at = block_size;

    while at + BATCH_HEADER_LEN <= data.len() {
        let torn = |what: String| -> Result<SegmentContents, StorageError> {
            if strict {
                Err(StorageError::Corrupt(what))
            } else {
                Ok(SegmentContents { entries: Vec::new(), used: 0 })
            }
        };

        let count = u32::from_le_bytes(data[at + 8..at + 12].try_into().unwrap()) as usize;
        if count == 0 {
            // Preallocated tail.
            break;
        }
        let headers_end = at + BATCH_HEADER_LEN + count * ENTRY_HEADER_LEN;
        if headers_end > data.len() {
            match torn(format!("batch at {} overruns segment", at)) {
                Ok(_) => break,
                Err(e) => return Err(e),
            }
        }
        let crc_header = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
        if crc32(&data[at + 8..headers_end]) != crc_header {
            match torn(format!("batch header checksum mismatch at {}", at)) {
                Ok(_) => break,
                Err(e) => return Err(e),
            }
        }

        let mut lens = Vec::with_capacity(count);
        let mut terms = Vec::with_capacity(count);
        let mut kinds = Vec::with_capacity(count);
        let mut header_at = at + BATCH_HEADER_LEN;
        for _ in 0..count {
            terms.push(u64::from_le_bytes(data[header_at..header_at + 8].try_into().unwrap()));
            kinds.push(u32::from_le_bytes(
                data[header_at + 8..header_at + 12].try_into().unwrap(),
            ));
            lens.push(u32::from_le_bytes(
                data[header_at + 12..header_at + 16].try_into().unwrap(),
            ) as usize);
            header_at += ENTRY_HEADER_LEN;
        }
        let payload_len: usize = lens.iter().sum();
        let raw_end = headers_end + payload_len;
        if raw_end > data.len() {
            match torn(format!("batch payload at {} overruns segment", at)) {
                Ok(_) => break,
                Err(e) => return Err(e),
            }
        }
        let crc_data = u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap());
        if crc32(&data[headers_end..raw_end]) != crc_data {
            match torn(format!("batch payload checksum mismatch at {}", at)) {
                Ok(_) => break,
                Err(e) => return Err(e),
            }
        }

        let mut payload_at = headers_end;
        for i in 0..count {
            let payload = Bytes::copy_from_slice(&data[payload_at..payload_at + lens[i]]);
            payload_at += lens[i];
            entries.push(Entry {
                term: terms[i],
                index: next_index,
                kind: kind_from_code(kinds[i])?,
                payload,
            });
            next_index += 1;
        }
        at = pad_to_block(raw_end, block_size);
    }

    Ok(SegmentContents { entries, used: at as u64 })
}
