//! ARCHIVIST - Write-Ahead Log (WAL)
//! Provides durability for the store by logging every mutation
//! (revision writes, range splits, file ingests) before it is applied.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ArchivistError, Result};
use crate::types::{Key, KeyRevision};

/// Operation type for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum OpType {
    Put = 1,
    Delete = 2,
    Split = 3,
    Ingest = 4,
    Unlink = 5,
}

impl OpType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(OpType::Put),
            2 => Some(OpType::Delete),
            3 => Some(OpType::Split),
            4 => Some(OpType::Ingest),
            5 => Some(OpType::Unlink),
            _ => None,
        }
    }
}

/// A logged store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A value or tombstone written through the ordinary write path.
    Revision(KeyRevision),
    /// The range containing `key` was split at `key`.
    Split { key: Key },
    /// Files attached, as one unit, to the range starting at `range_start`.
    Ingest { range_start: Key, file_ids: Vec<String> },
    /// Files detached from the range starting at `range_start`.
    Unlink { range_start: Key, file_ids: Vec<String> },
}

impl WalRecord {
    fn op_type(&self) -> OpType {
        match self {
            WalRecord::Revision(rev) if rev.is_tombstone() => OpType::Delete,
            WalRecord::Revision(_) => OpType::Put,
            WalRecord::Split { .. } => OpType::Split,
            WalRecord::Ingest { .. } => OpType::Ingest,
            WalRecord::Unlink { .. } => OpType::Unlink,
        }
    }
}

/// Write-Ahead Log for crash recovery and durability.
///
/// ## Binary Format (per entry)
/// ```text
/// [op_type: 1 byte][payload_len: 4 bytes (LE)][payload: bincode(WalRecord)][crc: 4 bytes]
/// ```
pub struct WriteAheadLog {
    /// Path to the WAL file on disk.
    path: PathBuf,
    /// File handle opened for appending.
    file: File,
    /// fsync after every append.
    sync: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file at the specified path.
    pub fn open(path: PathBuf, sync: bool) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file, sync })
    }

    /// Returns the path to the WAL file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Encode an entry into the binary WAL format.
    fn encode(record: &WalRecord) -> Result<BytesMut> {
        let payload = bincode::serialize(record)?;
        let mut buf = BytesMut::with_capacity(payload.len() + 9);
        buf.put_u8(record.op_type() as u8);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        Ok(buf)
    }

    /// Append a record. With `sync` enabled the record is on disk before
    /// this returns, so the in-memory state may be updated afterwards.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let encoded = Self::encode(record)?;
        self.file.write_all(&encoded)?;
        if self.sync {
            self.file.sync_all()?; // fsync for durability
        }
        Ok(())
    }

    /// Replay a WAL file.
    ///
    /// A truncated final entry (torn write) is dropped and the file is cut
    /// back to the last complete entry. A checksum mismatch on a complete
    /// entry is reported as corruption.
    pub fn recover(path: &Path) -> Result<Vec<WalRecord>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let rest = &bytes[offset..];
            if rest.len() < 9 {
                break;
            }
            let op = rest[0];
            let len = (&rest[1..5]).get_u32_le() as usize;
            if rest.len() < 9 + len {
                break;
            }
            let body = &rest[..5 + len];
            let crc = (&rest[5 + len..9 + len]).get_u32_le();
            if crc32fast::hash(body) != crc {
                return Err(ArchivistError::RecoveryFailed(format!(
                    "checksum mismatch at offset {} in {:?}",
                    offset, path
                )));
            }
            if OpType::from_u8(op).is_none() {
                return Err(ArchivistError::RecoveryFailed(format!(
                    "unknown op type {} at offset {}",
                    op, offset
                )));
            }
            let record: WalRecord = bincode::deserialize(&body[5..])
                .map_err(|e| ArchivistError::RecoveryFailed(e.to_string()))?;
            records.push(record);
            offset += 9 + len;
        }

        if offset < bytes.len() {
            log::warn!(
                "discarding {} bytes of torn WAL tail in {:?}",
                bytes.len() - offset,
                path
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn records() -> Vec<WalRecord> {
        vec![
            WalRecord::Revision(KeyRevision::put(
                b"k".to_vec(),
                Timestamp::new(1, 0),
                b"v".to_vec(),
            )),
            WalRecord::Revision(KeyRevision::tombstone(b"k".to_vec(), Timestamp::new(2, 0))),
            WalRecord::Split { key: b"m".to_vec() },
            WalRecord::Ingest {
                range_start: b"m".to_vec(),
                file_ids: vec!["0000abcd-1.sst".into()],
            },
        ]
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            for r in records() {
                wal.append(&r).unwrap();
            }
        }
        assert_eq!(WriteAheadLog::recover(&path).unwrap(), records());
    }

    #[test]
    fn test_recover_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let recovered = WriteAheadLog::recover(&dir.path().join("none.wal")).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), false).unwrap();
            for r in records() {
                wal.append(&r).unwrap();
            }
        }
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();

        let recovered = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovered.len(), 3);

        // The log is usable again after the tail was cut.
        let mut wal = WriteAheadLog::open(path.clone(), false).unwrap();
        wal.append(&WalRecord::Split { key: b"q".to_vec() }).unwrap();
        assert_eq!(WriteAheadLog::recover(&path).unwrap().len(), 4);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), false).unwrap();
            for r in records() {
                wal.append(&r).unwrap();
            }
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0x55;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            WriteAheadLog::recover(&path),
            Err(ArchivistError::RecoveryFailed(_))
        ));
    }
}
