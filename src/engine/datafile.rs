//! ARCHIVIST - DataFile (immutable sorted revision file)
//! On-disk format shared by backups, bulk loads and ingested store files.
//!
//! ## Binary Format
//! ```text
//! [magic: 8 bytes "ARCVDF01"]
//! record*: [kind: 1][key_len: 4 LE][key][wall: 8 LE][logical: 4 LE][val_len: 4 LE][value][crc: 4 LE]
//! footer:  [kind = 0xFF][len: 4 LE][bincode(DataFileFooter)][crc: 4 LE]
//! trailer: [footer_offset: 8 LE][magic: 8 bytes]
//! ```
//! Records are strictly ordered by (key asc, timestamp asc). The footer
//! carries the key and timestamp bounds so callers can learn what a file
//! holds without reading it.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ArchivistError, Result};
use crate::types::{Key, KeyRevision, KeySpan, Timestamp, TimestampSpan};

const MAGIC: &[u8; 8] = b"ARCVDF01";
const TRAILER_LEN: u64 = 16;

/// Record kind tags.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum RecordKind {
    Put = 1,
    Tombstone = 2,
    Footer = 0xFF,
}

impl RecordKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordKind::Put),
            2 => Some(RecordKind::Tombstone),
            0xFF => Some(RecordKind::Footer),
            _ => None,
        }
    }
}

/// Summary stored at the end of every DataFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileFooter {
    pub entry_count: u64,
    pub first_key: Option<Key>,
    pub last_key: Option<Key>,
    pub ts_bounds: Option<TimestampSpan>,
}

/// What a finished writer reports about the file it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileMeta {
    pub path: PathBuf,
    pub size: u64,
    /// CRC32 of the complete file contents.
    pub checksum: u32,
    pub footer: DataFileFooter,
}

/// Streaming writer for a sorted DataFile.
pub struct DataFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    written: u64,
    entry_count: u64,
    first_key: Option<Key>,
    last: Option<(Key, Timestamp)>,
    ts_bounds: Option<TimestampSpan>,
    sync: bool,
}

impl DataFileWriter {
    /// Create (or truncate) a DataFile at `path`.
    pub fn create(path: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            hasher: crc32fast::Hasher::new(),
            written: 0,
            entry_count: 0,
            first_key: None,
            last: None,
            ts_bounds: None,
            sync,
        };
        writer.write_raw(MAGIC)?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes written so far, header included.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// The last key appended, if any.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last.as_ref().map(|(k, _)| k.as_slice())
    }

    /// Append a revision. Revisions must arrive in strictly increasing
    /// (key, timestamp) order.
    pub fn add(&mut self, rev: &KeyRevision) -> Result<()> {
        if let Some((last_key, last_ts)) = &self.last {
            let in_order = match rev.key.as_slice().cmp(last_key.as_slice()) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => rev.timestamp > *last_ts,
                std::cmp::Ordering::Less => false,
            };
            if !in_order {
                return Err(ArchivistError::Corruption(format!(
                    "out-of-order revision {}@{} appended to {:?}",
                    crate::types::pretty_key(&rev.key),
                    rev.timestamp,
                    self.path
                )));
            }
        }

        let encoded = encode_record(rev);
        self.write_raw(&encoded)?;

        if self.first_key.is_none() {
            self.first_key = Some(rev.key.clone());
        }
        match self.ts_bounds.as_mut() {
            Some(bounds) => bounds.extend(rev.timestamp),
            None => self.ts_bounds = Some(TimestampSpan::point(rev.timestamp)),
        }
        self.last = Some((rev.key.clone(), rev.timestamp));
        self.entry_count += 1;
        Ok(())
    }

    /// Write the footer and trailer, flush, and report the file's metadata.
    pub fn finish(mut self) -> Result<DataFileMeta> {
        let footer = DataFileFooter {
            entry_count: self.entry_count,
            first_key: self.first_key.take(),
            last_key: self.last.take().map(|(k, _)| k),
            ts_bounds: self.ts_bounds,
        };
        let payload = bincode::serialize(&footer)?;
        let footer_offset = self.written;

        let mut buf = BytesMut::with_capacity(payload.len() + 9);
        buf.put_u8(RecordKind::Footer as u8);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.put_u64_le(footer_offset);
        buf.put_slice(MAGIC);
        self.write_raw(&buf)?;

        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_all()?;
        }

        Ok(DataFileMeta {
            path: self.path,
            size: self.written,
            checksum: self.hasher.finalize(),
            footer,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Encode one revision record, CRC included.
fn encode_record(rev: &KeyRevision) -> BytesMut {
    let value_len = rev.value.as_ref().map_or(0, |v| v.len());
    let mut buf = BytesMut::with_capacity(25 + rev.key.len() + value_len);
    let kind = if rev.is_tombstone() {
        RecordKind::Tombstone
    } else {
        RecordKind::Put
    };
    buf.put_u8(kind as u8);
    buf.put_u32_le(rev.key.len() as u32);
    buf.put_slice(&rev.key);
    buf.put_i64_le(rev.timestamp.wall_time);
    buf.put_u32_le(rev.timestamp.logical);
    buf.put_u32_le(value_len as u32);
    if let Some(value) = &rev.value {
        buf.put_slice(value);
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Read only the footer of a DataFile.
pub fn read_footer(path: &Path) -> Result<DataFileFooter> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < MAGIC.len() as u64 + TRAILER_LEN {
        return Err(ArchivistError::Corruption(format!(
            "{:?} is too short to be a data file",
            path
        )));
    }

    file.seek(SeekFrom::Start(len - TRAILER_LEN))?;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.read_exact(&mut trailer)?;
    let mut cursor = &trailer[..];
    let footer_offset = cursor.get_u64_le();
    if cursor != MAGIC {
        return Err(ArchivistError::Corruption(format!(
            "{:?} has a bad trailer magic",
            path
        )));
    }

    file.seek(SeekFrom::Start(footer_offset))?;
    let mut reader = BufReader::new(file);
    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    if RecordKind::from_u8(kind[0]) != Some(RecordKind::Footer) {
        return Err(ArchivistError::Corruption(format!(
            "{:?} footer offset does not point at a footer",
            path
        )));
    }
    read_footer_body(&mut reader, path)
}

fn read_footer_body<R: Read>(reader: &mut R, path: &Path) -> Result<DataFileFooter> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = (&len_buf[..]).get_u32_le() as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[RecordKind::Footer as u8]);
    hasher.update(&len_buf);
    hasher.update(&payload);
    if hasher.finalize() != (&crc_buf[..]).get_u32_le() {
        return Err(ArchivistError::Corruption(format!(
            "footer checksum mismatch in {:?}",
            path
        )));
    }
    Ok(bincode::deserialize(&payload)?)
}

/// Compute the CRC32 of a whole file.
pub fn file_checksum(path: &Path) -> Result<u32> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Forward-only reader over the revisions of a DataFile.
///
/// Verifies record checksums and (key, timestamp) ordering as it goes.
/// An optional key span restricts output to revisions inside it.
pub struct DataFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    span: Option<KeySpan>,
    last: Option<(Key, Timestamp)>,
    bytes_read: u64,
    footer: Option<DataFileFooter>,
    done: bool,
}

impl DataFileReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ArchivistError::Corruption(format!("{:?} is missing its header", path))
            } else {
                e.into()
            }
        })?;
        if &magic != MAGIC {
            return Err(ArchivistError::Corruption(format!(
                "{:?} is not a data file",
                path
            )));
        }
        Ok(Self {
            path,
            reader,
            span: None,
            last: None,
            bytes_read: MAGIC.len() as u64,
            footer: None,
            done: false,
        })
    }

    /// Only yield revisions whose key falls in `span`.
    pub fn with_span(mut self, span: KeySpan) -> Self {
        self.span = Some(span);
        self
    }

    /// Bytes consumed from the file so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The footer, once the reader has reached it.
    pub fn footer(&self) -> Option<&DataFileFooter> {
        self.footer.as_ref()
    }

    fn read_next(&mut self) -> Result<Option<KeyRevision>> {
        loop {
            let mut kind_buf = [0u8; 1];
            match self.reader.read_exact(&mut kind_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(ArchivistError::Corruption(format!(
                        "{:?} ends without a footer",
                        self.path
                    )));
                }
                Err(e) => return Err(e.into()),
            }
            let kind = RecordKind::from_u8(kind_buf[0]).ok_or_else(|| {
                ArchivistError::Corruption(format!(
                    "unknown record kind {} in {:?}",
                    kind_buf[0], self.path
                ))
            })?;

            if kind == RecordKind::Footer {
                let footer = read_footer_body(&mut self.reader, &self.path)?;
                self.footer = Some(footer);
                return Ok(None);
            }

            let rev = self.read_record(kind, kind_buf[0])?;
            if let Some(span) = &self.span {
                if rev.key.as_slice() < span.start.as_slice() {
                    continue;
                }
                if rev.key.as_slice() >= span.end.as_slice() {
                    return Ok(None);
                }
            }
            return Ok(Some(rev));
        }
    }

    fn read_record(&mut self, kind: RecordKind, kind_byte: u8) -> Result<KeyRevision> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind_byte]);

        let mut len_buf = [0u8; 4];
        self.read_hashed(&mut len_buf, &mut hasher)?;
        let key_len = (&len_buf[..]).get_u32_le() as usize;
        let mut key = vec![0u8; key_len];
        self.read_hashed(&mut key, &mut hasher)?;

        let mut ts_buf = [0u8; 12];
        self.read_hashed(&mut ts_buf, &mut hasher)?;
        let mut cursor = &ts_buf[..];
        let timestamp = Timestamp::new(cursor.get_i64_le(), cursor.get_u32_le());

        self.read_hashed(&mut len_buf, &mut hasher)?;
        let val_len = (&len_buf[..]).get_u32_le() as usize;
        let mut value = vec![0u8; val_len];
        self.read_hashed(&mut value, &mut hasher)?;

        let mut crc_buf = [0u8; 4];
        self.reader.read_exact(&mut crc_buf)?;
        if hasher.finalize() != (&crc_buf[..]).get_u32_le() {
            return Err(ArchivistError::Corruption(format!(
                "record checksum mismatch in {:?}",
                self.path
            )));
        }
        self.bytes_read += 1 + 4 + key_len as u64 + 12 + 4 + val_len as u64 + 4;

        if let Some((last_key, last_ts)) = &self.last {
            if (key.as_slice(), timestamp) <= (last_key.as_slice(), *last_ts) {
                return Err(ArchivistError::Corruption(format!(
                    "unsorted revisions in {:?}",
                    self.path
                )));
            }
        }
        self.last = Some((key.clone(), timestamp));

        Ok(match kind {
            RecordKind::Tombstone => KeyRevision::tombstone(key, timestamp),
            _ => KeyRevision::put(key, timestamp, value),
        })
    }

    fn read_hashed(&mut self, buf: &mut [u8], hasher: &mut crc32fast::Hasher) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ArchivistError::Corruption(format!("truncated record in {:?}", self.path))
            } else {
                e.into()
            }
        })?;
        hasher.update(buf);
        Ok(())
    }
}

impl Iterator for DataFileReader {
    type Item = Result<KeyRevision>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(rev)) => Some(Ok(rev)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    fn sample() -> Vec<KeyRevision> {
        vec![
            KeyRevision::put(b"apple".to_vec(), ts(1), b"red".to_vec()),
            KeyRevision::put(b"apple".to_vec(), ts(5), b"green".to_vec()),
            KeyRevision::tombstone(b"banana".to_vec(), ts(3)),
            KeyRevision::put(b"cherry".to_vec(), ts(2), b"dark".to_vec()),
        ]
    }

    fn write_sample(path: &Path) -> DataFileMeta {
        let mut writer = DataFileWriter::create(path, false).unwrap();
        for rev in sample() {
            writer.add(&rev).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sst");
        let meta = write_sample(&path);

        assert_eq!(meta.footer.entry_count, 4);
        assert_eq!(meta.footer.first_key, Some(b"apple".to_vec()));
        assert_eq!(meta.footer.last_key, Some(b"cherry".to_vec()));
        assert_eq!(
            meta.footer.ts_bounds,
            Some(TimestampSpan {
                min: ts(1),
                max: ts(5)
            })
        );
        assert_eq!(meta.size, std::fs::metadata(&path).unwrap().len());
        assert_eq!(meta.checksum, file_checksum(&path).unwrap());

        let read: Vec<KeyRevision> = DataFileReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, sample());
        assert_eq!(read_footer(&path).unwrap(), meta.footer);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sst");
        let meta = DataFileWriter::create(&path, false).unwrap().finish().unwrap();
        assert_eq!(meta.footer.entry_count, 0);
        assert_eq!(meta.footer.ts_bounds, None);
        assert_eq!(DataFileReader::open(&path).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_out_of_order_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DataFileWriter::create(dir.path().join("x.sst"), false).unwrap();
        writer
            .add(&KeyRevision::put(b"b".to_vec(), ts(1), b"1".to_vec()))
            .unwrap();
        let err = writer
            .add(&KeyRevision::put(b"a".to_vec(), ts(1), b"1".to_vec()))
            .unwrap_err();
        assert!(matches!(err, ArchivistError::Corruption(_)));

        // Same key, same timestamp is a duplicate.
        assert!(writer
            .add(&KeyRevision::put(b"b".to_vec(), ts(1), b"2".to_vec()))
            .is_err());
    }

    #[test]
    fn test_span_clipping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sst");
        write_sample(&path);

        let keys: Vec<Key> = DataFileReader::open(&path)
            .unwrap()
            .with_span(KeySpan::new(b"b".to_vec(), b"c".to_vec()))
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"banana".to_vec()]);
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sst");
        write_sample(&path);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[MAGIC.len() + 6] ^= 0xFF; // flip a byte inside the first key
        std::fs::write(&path, &bytes).unwrap();

        let result: Result<Vec<KeyRevision>> = DataFileReader::open(&path).unwrap().collect();
        assert!(matches!(result, Err(ArchivistError::Corruption(_))));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.sst");
        std::fs::write(&path, b"definitely not a data file").unwrap();
        assert!(DataFileReader::open(&path).is_err());
        assert!(read_footer(&path).is_err());
    }
}
