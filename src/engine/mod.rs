//! ARCHIVIST - Storage Engine Module
//! The range-partitioned, timestamp-versioned store that backups read
//! from and restores ingest into.
//!
//! The backup, restore and scan code only talks to the [`RangeStore`]
//! trait; [`Store`] is the durable in-process implementation.

pub mod datafile;
pub mod memtable;
pub mod merge;
pub mod metrics;
pub mod range;
pub mod wal;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::error::{ArchivistError, Result};
use crate::hlc::Clock;
use crate::types::{
    pretty_key, Key, KeyRevision, KeySpan, RangeId, Timestamp, TimestampSpan, Value, KEY_MAX,
};

use self::datafile::{file_checksum, read_footer};
use self::merge::RevisionIter;
use self::metrics::Metrics;
use self::range::{IngestedFile, Range, RangeDescriptor};
use self::wal::{WalRecord, WriteAheadLog};

/// A DataFile offered to a range for bulk ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFile {
    /// Stable identity; ingesting the same id twice is a no-op.
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: u32,
}

/// Result of one bulk file add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Ids newly attached by this call.
    pub added: Vec<String>,
    /// Files the range already had.
    pub skipped: usize,
}

/// The interface the backup, restore and scan paths need from the
/// range/storage layer.
pub trait RangeStore: Send + Sync {
    /// All ranges, sorted by start key, together covering the key space.
    fn ranges(&self) -> Result<Vec<RangeDescriptor>>;

    /// Min/max write timestamp the range has observed, or `None` if it
    /// has never held a revision. Reading this must not touch range data.
    fn timestamp_summary(&self, id: RangeId) -> Result<Option<TimestampSpan>>;

    /// Sorted (key asc, ts asc) stream of the range's revisions. With a
    /// `[lo, hi)` window the store may omit data it knows lies outside it.
    ///
    /// Fails with a transient error if the range no longer has the span
    /// `range` describes.
    fn iter_range(&self, range: &RangeDescriptor, window: Option<(Timestamp, Timestamp)>) -> Result<RevisionIter>;

    /// Atomically attach `files` to the range. Files it already holds are
    /// skipped. Fails with a transient error, attaching nothing, if the
    /// range no longer has the span `range` describes.
    fn ingest(&self, range: &RangeDescriptor, files: &[IngestFile]) -> Result<IngestOutcome>;

    /// Detach previously ingested files.
    fn unlink(&self, id: RangeId, file_ids: &[String]) -> Result<()>;

    /// The timestamp oracle writes to this store are tagged by.
    fn clock(&self) -> &Clock;

    /// A timestamp at or below which no further writes can appear: every
    /// write tagged `<=` the returned value is already readable.
    fn resolved_timestamp(&self) -> Result<Timestamp>;

    /// The current ranges intersecting `span`, in key order.
    fn ranges_overlapping(&self, span: &KeySpan) -> Result<Vec<RangeDescriptor>> {
        Ok(self
            .ranges()?
            .into_iter()
            .filter(|r| r.span.overlaps(span))
            .collect())
    }
}

type RangeHandle = Arc<RwLock<Range>>;

/// The core Archivist store.
/// Coordinates ranges, the WAL, ingested files and the clock
/// to provide a durable MVCC key-value store.
pub struct Store {
    /// Sorted by span start; spans are contiguous and cover the key space.
    ranges: RwLock<Vec<RangeHandle>>,
    /// Write-ahead log for crash recovery.
    wal: Mutex<WriteAheadLog>,
    clock: Arc<Clock>,
    next_range_id: AtomicU64,
    metrics: Metrics,
    /// Engine configuration.
    config: Config,
}

fn poisoned<T>(_: T) -> ArchivistError {
    ArchivistError::Poisoned("store")
}

impl Store {
    /// Open or create a store at the configured path with its own clock.
    pub fn open(config: Config) -> Result<Self> {
        let clock = Arc::new(Clock::new(config.max_clock_offset));
        Self::open_with_clock(config, clock)
    }

    /// Open or create a store whose writes are tagged by a shared clock.
    pub fn open_with_clock(config: Config, clock: Arc<Clock>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let wal_path = config.data_dir.join("archivist.wal");
        let records = WriteAheadLog::recover(&wal_path)?;
        let wal = WriteAheadLog::open(wal_path, config.sync_writes)?;

        let store = Self {
            ranges: RwLock::new(vec![Arc::new(RwLock::new(Range::new(
                RangeId(1),
                KeySpan::full(),
            )))]),
            wal: Mutex::new(wal),
            clock,
            next_range_id: AtomicU64::new(2),
            metrics: Metrics::new(),
            config,
        };

        let recovered = records.len();
        let max_ts = store.replay(records)?;
        if let Some(ts) = max_ts {
            store.clock.update(ts)?;
        }

        log::info!(
            "Archivist store opened at {:?} ({} WAL records recovered, {} ranges)",
            store.config.data_dir,
            recovered,
            store.range_count()
        );
        Ok(store)
    }

    fn replay(&self, records: Vec<WalRecord>) -> Result<Option<Timestamp>> {
        let mut max_ts: Option<Timestamp> = None;
        let mut ranges = self.ranges.write().map_err(poisoned)?;
        let mut file_cache: BTreeMap<String, Arc<IngestedFile>> = BTreeMap::new();

        for record in records {
            match record {
                WalRecord::Revision(rev) => {
                    max_ts = max_ts.max(Some(rev.timestamp));
                    let idx = locate(&ranges, &rev.key)?;
                    ranges[idx].write().map_err(poisoned)?.apply(rev);
                }
                WalRecord::Split { key } => {
                    self.split_locked(&mut ranges, &key)?;
                }
                WalRecord::Ingest {
                    range_start,
                    file_ids,
                } => {
                    let mut files = Vec::with_capacity(file_ids.len());
                    for id in file_ids {
                        let file = match file_cache.get(&id) {
                            Some(f) => Arc::clone(f),
                            None => {
                                let f = Arc::new(self.load_ingested(&id)?);
                                file_cache.insert(id, Arc::clone(&f));
                                f
                            }
                        };
                        if let Some(bounds) = file.footer.ts_bounds {
                            max_ts = max_ts.max(Some(bounds.max));
                        }
                        files.push(file);
                    }
                    let idx = locate(&ranges, &range_start)?;
                    ranges[idx].write().map_err(poisoned)?.attach(files);
                }
                WalRecord::Unlink {
                    range_start,
                    file_ids,
                } => {
                    let idx = locate(&ranges, &range_start)?;
                    ranges[idx].write().map_err(poisoned)?.detach(&file_ids);
                }
            }
        }
        Ok(max_ts)
    }

    fn files_dir(&self) -> PathBuf {
        self.config.data_dir.join("files")
    }

    fn load_ingested(&self, id: &str) -> Result<IngestedFile> {
        let path = self.files_dir().join(id);
        let footer = read_footer(&path).map_err(|e| {
            ArchivistError::RecoveryFailed(format!("ingested file {} unreadable: {}", id, e))
        })?;
        Ok(IngestedFile {
            id: id.to_string(),
            path,
            footer,
        })
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.is_empty() || key >= KEY_MAX {
            return Err(ArchivistError::Input {
                statement: None,
                message: format!("key {} is outside the user key space", pretty_key(key)),
            });
        }
        Ok(())
    }

    fn handle(&self, id: RangeId) -> Result<RangeHandle> {
        let ranges = self.ranges.read().map_err(poisoned)?;
        for handle in ranges.iter() {
            if handle.read().map_err(poisoned)?.id() == id {
                return Ok(Arc::clone(handle));
            }
        }
        Err(ArchivistError::TransientIo {
            range: id,
            message: "range not found (split or relocated)".into(),
        })
    }

    /// Fails if the live range no longer covers exactly the described span.
    fn check_span(live: &Range, expected: &RangeDescriptor) -> Result<()> {
        if live.span() != &expected.span {
            return Err(ArchivistError::TransientIo {
                range: expected.id,
                message: format!(
                    "range span changed from [{}, {}) to [{}, {}) (split or merged)",
                    pretty_key(&expected.span.start),
                    pretty_key(&expected.span.end),
                    pretty_key(&live.span().start),
                    pretty_key(&live.span().end)
                ),
            });
        }
        Ok(())
    }

    /// Write one revision through the ordinary (per-row) write path.
    /// The timestamp is issued and the revision applied under the WAL lock.
    fn write(&self, key: Key, value: Option<Value>) -> Result<Timestamp> {
        let ranges = self.ranges.read().map_err(poisoned)?;
        let idx = locate(&ranges, &key)?;
        let mut wal = self.wal.lock().map_err(poisoned)?;
        let ts = self.clock.now()?;
        let rev = match value {
            Some(value) => KeyRevision::put(key, ts, value),
            None => KeyRevision::tombstone(key, ts),
        };
        // Step 1: Write to WAL first (durability)
        wal.append(&WalRecord::Revision(rev.clone()))?;
        // Step 2: Apply to the owning range
        ranges[idx].write().map_err(poisoned)?.apply(rev);
        Ok(ts)
    }

    /// Insert a key-value pair, returning the timestamp it was written at.
    pub fn put(&self, key: Key, value: Value) -> Result<Timestamp> {
        Self::validate_key(&key)?;
        self.metrics.record_put();
        self.write(key, Some(value))
    }

    /// Delete a key by writing a tombstone revision.
    pub fn delete(&self, key: Key) -> Result<Timestamp> {
        Self::validate_key(&key)?;
        self.metrics.record_delete();
        self.write(key, None)
    }

    /// Latest value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.get_at(key, Timestamp::MAX)
    }

    /// Value of `key` as of `as_of` (newest revision with ts <= as_of).
    pub fn get_at(&self, key: &[u8], as_of: Timestamp) -> Result<Option<Value>> {
        self.metrics.record_get();
        let ranges = self.ranges.read().map_err(poisoned)?;
        let idx = locate(&ranges, key)?;
        let range = ranges[idx].read().map_err(poisoned)?;
        Ok(range.get(key, as_of)?.and_then(|rev| rev.value))
    }

    /// All live key-value pairs as of `as_of`, in key order.
    pub fn snapshot_at(&self, as_of: Timestamp) -> Result<Vec<(Key, Value)>> {
        let mut out = Vec::new();
        for desc in self.ranges()? {
            let mut current: Option<KeyRevision> = None;
            for rev in self.iter_range(&desc, None)? {
                let rev = rev?;
                if rev.timestamp > as_of {
                    continue;
                }
                if let Some(prev) = current.take() {
                    if prev.key != rev.key {
                        if let Some(value) = prev.value {
                            out.push((prev.key, value));
                        }
                    }
                }
                current = Some(rev);
            }
            if let Some(KeyRevision {
                key,
                value: Some(value),
                ..
            }) = current
            {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// All live key-value pairs, in key order.
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.snapshot_at(Timestamp::MAX)
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        Ok(self.scan()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Split the range containing `key` so that a new range starts at `key`.
    /// Splitting at an existing boundary is a no-op.
    pub fn split_at(&self, key: &[u8]) -> Result<RangeId> {
        Self::validate_key(key)?;
        let mut ranges = self.ranges.write().map_err(poisoned)?;
        {
            let idx = locate(&ranges, key)?;
            let range = ranges[idx].read().map_err(poisoned)?;
            if range.span().start.as_slice() == key {
                return Ok(range.id());
            }
        }
        self.wal.lock().map_err(poisoned)?.append(&WalRecord::Split {
            key: key.to_vec(),
        })?;
        let id = self.split_locked(&mut ranges, key)?;
        log::info!("split range at {} -> new range {}", pretty_key(key), id);
        Ok(id)
    }

    fn split_locked(&self, ranges: &mut Vec<RangeHandle>, key: &[u8]) -> Result<RangeId> {
        let idx = locate(ranges, key)?;
        let right = {
            let mut left = ranges[idx].write().map_err(poisoned)?;
            if left.span().start.as_slice() == key {
                return Ok(left.id());
            }
            let id = RangeId(self.next_range_id.fetch_add(1, Ordering::SeqCst));
            left.split(key, id)
        };
        let id = right.id();
        ranges.insert(idx + 1, Arc::new(RwLock::new(right)));
        Ok(id)
    }

    pub fn range_count(&self) -> usize {
        self.ranges.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Number of files attached to the given range.
    pub fn file_count(&self, id: RangeId) -> Result<usize> {
        Ok(self.handle(id)?.read().map_err(poisoned)?.file_count())
    }

    /// Total bytes buffered across all range MemTables.
    pub fn memtable_size(&self) -> usize {
        let Ok(ranges) = self.ranges.read() else {
            return 0;
        };
        ranges
            .iter()
            .filter_map(|r| r.read().ok().map(|r| r.memtable_size()))
            .sum()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Copy an offered file into the store's file directory, verifying its
    /// checksum, unless an identical copy is already there.
    fn adopt_file(&self, range: RangeId, file: &IngestFile) -> Result<IngestedFile> {
        let dest = self.files_dir().join(&file.id);
        let already_present = fs::metadata(&dest).map(|m| m.len() == file.size).unwrap_or(false)
            && file_checksum(&dest)? == file.checksum;

        if !already_present {
            let tmp = self.files_dir().join(format!("{}.{}.tmp", file.id, range.0));
            fs::copy(&file.path, &tmp).map_err(|e| copy_error(range, &file.path, e))?;
            let checksum = file_checksum(&tmp)?;
            if checksum != file.checksum {
                let _ = fs::remove_file(&tmp);
                return Err(ArchivistError::Corruption(format!(
                    "checksum mismatch for {:?}: expected {:08x}, found {:08x}",
                    file.path, file.checksum, checksum
                )));
            }
            fs::rename(&tmp, &dest)?;
        }

        Ok(IngestedFile {
            id: file.id.clone(),
            footer: read_footer(&dest)?,
            path: dest,
        })
    }
}

fn copy_error(range: RangeId, path: &Path, err: std::io::Error) -> ArchivistError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ArchivistError::Io(err),
        _ => ArchivistError::TransientIo {
            range,
            message: format!("copying {:?}: {}", path, err),
        },
    }
}

/// Index of the range whose span contains `key`.
fn locate(ranges: &[RangeHandle], key: &[u8]) -> Result<usize> {
    // Ranges are contiguous, so the owner is the last one starting <= key.
    let mut lo = 0usize;
    let mut hi = ranges.len();
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        let start_le = ranges[mid].read().map_err(poisoned)?.span().start.as_slice() <= key;
        if start_le {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

impl RangeStore for Store {
    fn ranges(&self) -> Result<Vec<RangeDescriptor>> {
        let ranges = self.ranges.read().map_err(poisoned)?;
        ranges
            .iter()
            .map(|r| Ok(r.read().map_err(poisoned)?.descriptor()))
            .collect()
    }

    fn timestamp_summary(&self, id: RangeId) -> Result<Option<TimestampSpan>> {
        Ok(self.handle(id)?.read().map_err(poisoned)?.timestamp_summary())
    }

    fn iter_range(&self, range: &RangeDescriptor, window: Option<(Timestamp, Timestamp)>) -> Result<RevisionIter> {
        let handle = self.handle(range.id)?;
        let live = handle.read().map_err(poisoned)?;
        Self::check_span(&live, range)?;
        live.iter(window)
    }

    fn ingest(&self, target: &RangeDescriptor, files: &[IngestFile]) -> Result<IngestOutcome> {
        let id = target.id;
        let handle = self.handle(id)?;
        let pending: Vec<&IngestFile> = {
            let range = handle.read().map_err(poisoned)?;
            Self::check_span(&range, target)?;
            files.iter().filter(|f| !range.has_file(&f.id)).collect()
        };
        let skipped = files.len() - pending.len();

        let mut adopted = Vec::with_capacity(pending.len());
        for file in pending {
            adopted.push(Arc::new(self.adopt_file(id, file)?));
        }

        // One WAL record and one range mutation: the add is all-or-nothing.
        let mut wal = self.wal.lock().map_err(poisoned)?;
        let mut range = handle.write().map_err(poisoned)?;
        Self::check_span(&range, target)?;
        adopted.retain(|f| !range.has_file(&f.id));
        let skipped = skipped + (files.len() - skipped - adopted.len());
        if adopted.is_empty() {
            self.metrics.record_ingest(0, skipped);
            return Ok(IngestOutcome {
                added: Vec::new(),
                skipped,
            });
        }
        wal.append(&WalRecord::Ingest {
            range_start: range.span().start.clone(),
            file_ids: adopted.iter().map(|f| f.id.clone()).collect(),
        })?;
        let added = range.attach(adopted);
        self.metrics.record_ingest(added.len(), skipped);
        log::debug!("range {}: ingested {} files ({} already present)", id, added.len(), skipped);
        Ok(IngestOutcome { added, skipped })
    }

    fn unlink(&self, id: RangeId, file_ids: &[String]) -> Result<()> {
        let handle = self.handle(id)?;
        let mut wal = self.wal.lock().map_err(poisoned)?;
        let mut range = handle.write().map_err(poisoned)?;
        let present: Vec<String> = file_ids
            .iter()
            .filter(|f| range.has_file(f))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(());
        }
        wal.append(&WalRecord::Unlink {
            range_start: range.span().start.clone(),
            file_ids: present.clone(),
        })?;
        range.detach(&present);
        log::debug!("range {}: unlinked {} files", id, present.len());
        Ok(())
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }

    fn resolved_timestamp(&self) -> Result<Timestamp> {
        // Writers issue and apply under the WAL lock, so nothing tagged at
        // or below this reading is still in flight.
        let _wal = self.wal.lock().map_err(poisoned)?;
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::datafile::DataFileWriter;

    fn temp_config(dir: &Path) -> Config {
        Config::new(dir).with_sync_writes(false)
    }

    fn write_file(path: &Path, revs: &[KeyRevision]) -> IngestFile {
        let mut writer = DataFileWriter::create(path, false).unwrap();
        for rev in revs {
            writer.add(rev).unwrap();
        }
        let meta = writer.finish().unwrap();
        IngestFile {
            id: format!("{:08x}-test.sst", meta.checksum),
            path: path.to_path_buf(),
            size: meta.size,
            checksum: meta.checksum,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();

        let t1 = store.put(b"name".to_vec(), b"archivist".to_vec()).unwrap();
        let t2 = store.delete(b"name".to_vec()).unwrap();
        assert!(t2 > t1);
        assert_eq!(store.get(b"name").unwrap(), None);
        assert_eq!(store.get_at(b"name", t1).unwrap(), Some(b"archivist".to_vec()));
    }

    #[test]
    fn test_rejects_keys_outside_user_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        assert!(store.put(Vec::new(), b"v".to_vec()).is_err());
        assert!(store.put(vec![0xff, 0xff, 0x01], b"v".to_vec()).is_err());
    }

    #[test]
    fn test_split_routes_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let right = store.split_at(b"m").unwrap();
        store.put(b"z".to_vec(), b"2".to_vec()).unwrap();

        let ranges = store.ranges().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].id, right);
        assert_eq!(ranges[0].span.end, b"m".to_vec());

        // Splitting at an existing boundary does nothing.
        assert_eq!(store.split_at(b"m").unwrap(), right);
        assert_eq!(store.range_count(), 2);

        assert_eq!(
            store.scan().unwrap(),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"z".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        let file = write_file(
            &dir.path().join("in.sst"),
            &[KeyRevision::put(b"k".to_vec(), Timestamp::new(7, 0), b"v".to_vec())],
        );
        let desc = store.ranges().unwrap().remove(0);
        let id = desc.id;

        let first = store.ingest(&desc, &[file.clone()]).unwrap();
        assert_eq!(first.added.len(), 1);
        let second = store.ingest(&desc, &[file]).unwrap();
        assert!(second.added.is_empty());
        assert_eq!(second.skipped, 1);
        assert_eq!(store.file_count(id).unwrap(), 1);
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_ingest_rejects_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        let mut file = write_file(
            &dir.path().join("in.sst"),
            &[KeyRevision::put(b"k".to_vec(), Timestamp::new(7, 0), b"v".to_vec())],
        );
        file.checksum ^= 1;
        let desc = store.ranges().unwrap().remove(0);
        let id = desc.id;
        assert!(matches!(
            store.ingest(&desc, &[file]),
            Err(ArchivistError::Corruption(_))
        ));
        assert_eq!(store.file_count(id).unwrap(), 0);
    }

    #[test]
    fn test_unlink_reverts_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        let file = write_file(
            &dir.path().join("in.sst"),
            &[KeyRevision::put(b"k".to_vec(), Timestamp::new(7, 0), b"v".to_vec())],
        );
        let desc = store.ranges().unwrap().remove(0);
        let id = desc.id;
        let outcome = store.ingest(&desc, &[file]).unwrap();
        store.unlink(id, &outcome.added).unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        assert_eq!(store.timestamp_summary(id).unwrap(), None);
    }

    #[test]
    fn test_recovery_replays_everything() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(
            &dir.path().join("in.sst"),
            &[KeyRevision::put(b"x".to_vec(), Timestamp::new(7, 0), b"ingested".to_vec())],
        );
        let last_write;
        {
            let store = Store::open(temp_config(dir.path())).unwrap();
            store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            store.split_at(b"m").unwrap();
            let right = store.ranges().unwrap().remove(1);
            store.ingest(&right, &[file]).unwrap();
            last_write = store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        }

        let store = Store::open(temp_config(dir.path())).unwrap();
        assert_eq!(store.range_count(), 2);
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"x").unwrap(), Some(b"ingested".to_vec()));
        assert!(store.clock().now().unwrap() > last_write);
    }

    #[test]
    fn test_stale_descriptor_is_rejected_after_split() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let planned = store.ranges().unwrap().remove(0);
        store.split_at(b"m").unwrap();

        assert!(matches!(
            store.iter_range(&planned, None),
            Err(ArchivistError::TransientIo { .. })
        ));

        let file = write_file(
            &dir.path().join("in.sst"),
            &[KeyRevision::put(b"z".to_vec(), Timestamp::new(7, 0), b"v".to_vec())],
        );
        assert!(matches!(
            store.ingest(&planned, &[file.clone()]),
            Err(ArchivistError::TransientIo { .. })
        ));
        assert_eq!(store.file_count(planned.id).unwrap(), 0);

        let live = store.ranges_overlapping(&KeySpan::new(b"x".to_vec(), b"y".to_vec())).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].span.start, b"m".to_vec());
        store.ingest(&live[0], &[file]).unwrap();
        assert_eq!(store.get(b"z").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_resolved_timestamp_covers_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_config(dir.path())).unwrap();

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..200u32 {
                        let key = format!("w{}-{:04}", t, i).into_bytes();
                        store.put(key, b"v".to_vec()).unwrap();
                    }
                });
            }
            for _ in 0..20 {
                let resolved = store.resolved_timestamp().unwrap();
                let first = store.snapshot_at(resolved).unwrap();
                // Nothing at or below a resolved timestamp may appear later.
                assert_eq!(store.snapshot_at(resolved).unwrap(), first);
                std::thread::yield_now();
            }
        });
        assert_eq!(store.len().unwrap(), 800);
    }
}
