//! Crash-safe persistence of term, vote and the first retained log index.
//!
//! Two fixed-size files (`metadata1` / `metadata2`) rotate: a write targets
//! the file holding the older version counter, a reader picks the one with
//! the newer counter that passes its checksum. A torn write therefore only
//! ever damages the older copy.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::StorageError;

/// Both metadata files are preallocated to this size.
pub const METADATA_FILE_SIZE: u64 = 8192;

const METADATA_FORMAT: u64 = 1;
const RECORD_LEN: usize = 48;

/// CRC32 (IEEE polynomial), shared with the segment format.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// One decoded metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Rotation counter, monotonically increasing across writes.
    pub version: u64,
    pub term: u64,
    pub voted_for: Option<u64>,
    /// First log index retained in the segment files.
    pub first_index: u64,
}

impl MetadataRecord {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&METADATA_FORMAT.to_le_bytes());
        buf[8..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.term.to_le_bytes());
        buf[24..32].copy_from_slice(&self.voted_for.unwrap_or(0).to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_index.to_le_bytes());
        let crc = crc32(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode a slot. `Ok(None)` for a blank (never written) slot or a slot
    /// damaged by a torn write; the caller falls back to the other file.
    fn decode(buf: &[u8]) -> Result<Option<MetadataRecord>, StorageError> {
        if buf.len() < RECORD_LEN || buf[..RECORD_LEN].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let crc = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        if crc32(&buf[0..40]) != crc {
            return Ok(None);
        }
        let format = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if format != METADATA_FORMAT {
            return Err(StorageError::Corrupt(format!(
                "unsupported metadata format {}",
                format
            )));
        }
        let voted_for = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        Ok(Some(MetadataRecord {
            version: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            term: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            voted_for: (voted_for != 0).then_some(voted_for),
            first_index: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }))
    }
}

pub(crate) fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Rotating two-file metadata store.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
    current: MetadataRecord,
}

impl MetadataStore {
    fn slot_path(dir: &Path, version: u64) -> PathBuf {
        // Odd versions live in metadata1, even in metadata2.
        if version % 2 == 1 {
            dir.join("metadata1")
        } else {
            dir.join("metadata2")
        }
    }

    fn read_slot(path: &Path) -> Result<Option<MetadataRecord>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = vec![0u8; RECORD_LEN];
        let mut file = File::open(path)?;
        let mut read = 0;
        while read < RECORD_LEN {
            match file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        MetadataRecord::decode(&buf[..read.min(RECORD_LEN)])
    }

    /// Open the store, picking the newest valid record. A fresh directory
    /// yields `{version: 0, term: 0, no vote, first_index: 1}`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let a = Self::read_slot(&dir.join("metadata1"))?;
        let b = Self::read_slot(&dir.join("metadata2"))?;
        let current = match (a, b) {
            (Some(a), Some(b)) => {
                if a.version == b.version {
                    return Err(StorageError::Corrupt(
                        "metadata files carry the same version".into(),
                    ));
                }
                if a.version > b.version {
                    a
                } else {
                    b
                }
            }
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => MetadataRecord { version: 0, term: 0, voted_for: None, first_index: 1 },
        };
        Ok(MetadataStore { dir: dir.to_path_buf(), current })
    }

    pub fn record(&self) -> &MetadataRecord {
        &self.current
    }

    /// Durably write a new record into the slot holding the older version.
    pub fn save(
        &mut self,
        term: u64,
        voted_for: Option<u64>,
        first_index: u64,
    ) -> Result<(), StorageError> {
        let record = MetadataRecord {
            version: self.current.version + 1,
            term,
            voted_for,
            first_index,
        };
        let path = Self::slot_path(&self.dir, record.version);
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        if fresh {
            file.set_len(METADATA_FILE_SIZE)?;
        }
        file.write_all(&record.encode())?;
        file.sync_all()?;
        if fresh {
            sync_dir(&self.dir)?;
        }
        self.current = record;
        Ok(())
    }
}
