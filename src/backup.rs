//! ARCHIVIST - Backup Coordinator
//! Full and incremental backups of a store as of a target timestamp.
//!
//! ## Algorithm
//! 1. `start` = the base manifest's end (incremental) or 0 (full);
//!    `end` = the successor of the as-of timestamp, which is the requested
//!    one or the store's resolved timestamp. Writes at as-of are included.
//!    An incremental with nothing new (`start == end`) is valid and empty.
//! 2. One task per range (clipped to the backed-up spans) scans `[start, end)`
//!    and writes a DataFile only if at least one revision qualifies. A task
//!    whose range split meanwhile re-plans onto the ranges now covering it.
//! 3. After every task joins, the manifest is sealed and published atomically
//!
//! Any terminal range failure (or cancellation) deletes the files this
//! backup staged and publishes no manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::Config;
use crate::engine::datafile::{DataFileMeta, DataFileWriter};
use crate::engine::metrics::{Metrics, MetricsSnapshot};
use crate::engine::range::RangeDescriptor;
use crate::engine::RangeStore;
use crate::error::{ArchivistError, Result};
use crate::manifest::{self, BackupManifest, ManifestEntry};
use crate::pool::{first_error, run_parallel, CancelToken};
use crate::scan::{ScanOptions, TimeBoundScanner};
use crate::types::{normalize_spans, KeyRevision, KeySpan, Timestamp};

/// Subdirectory of a backup holding its DataFiles.
pub const DATA_DIR: &str = "data";

/// What to back up and where.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub dataset: String,
    /// Key space to back up. Incrementals must repeat their base's spans.
    pub spans: Vec<KeySpan>,
    pub dest: PathBuf,
    /// Inclusive upper bound on backed-up writes. Defaults to the store's
    /// resolved timestamp.
    pub as_of: Option<Timestamp>,
    /// Backup directory (or manifest) this one is incremental to.
    pub base: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl BackupOptions {
    /// A full backup of the whole key space.
    pub fn new(dataset: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            dataset: dataset.into(),
            spans: vec![KeySpan::full()],
            dest: dest.into(),
            as_of: None,
            base: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_spans(mut self, spans: Vec<KeySpan>) -> Self {
        self.spans = spans;
        self
    }

    pub fn with_as_of(mut self, as_of: Timestamp) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Make this an incremental backup on top of `base`.
    pub fn incremental_from(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub manifest_path: PathBuf,
    pub manifest: BackupManifest,
    /// Sum of the sizes of the DataFiles produced.
    pub total_size: u64,
    pub metrics: MetricsSnapshot,
}

/// One unit of backup work: a range clipped to one backed-up span.
struct ExportTask {
    index: usize,
    range: RangeDescriptor,
    span: KeySpan,
}

/// Back up `store` according to `options`.
pub fn backup<S: RangeStore + ?Sized>(store: &S, config: &Config, options: &BackupOptions) -> Result<BackupOutcome> {
    config.validate()?;
    if manifest::exists(&options.dest) {
        return Err(ArchivistError::Consistency(format!(
            "{:?} already holds a backup manifest",
            options.dest
        )));
    }

    let resolved = store.resolved_timestamp()?;
    let as_of = match options.as_of {
        Some(as_of) if as_of > resolved => {
            return Err(ArchivistError::Consistency(format!(
                "as-of timestamp {} is not yet resolved (resolved {})",
                as_of, resolved
            )))
        }
        Some(as_of) => as_of,
        None => resolved,
    };
    let end = as_of.next();

    let (start, spans) = match &options.base {
        Some(base_dir) => {
            let base = BackupManifest::read(base_dir)?;
            if base.dataset != options.dataset {
                return Err(ArchivistError::Consistency(format!(
                    "base backup is of dataset {:?}, not {:?}",
                    base.dataset, options.dataset
                )));
            }
            if base.spans != normalize_spans(options.spans.clone()) {
                return Err(ArchivistError::Consistency(
                    "incremental backup must cover the same key spans as its base".into(),
                ));
            }
            (base.end_timestamp, base.spans)
        }
        None => (Timestamp::ZERO, normalize_spans(options.spans.clone())),
    };
    if start > end {
        return Err(ArchivistError::Consistency(format!(
            "as-of timestamp {} precedes the base backup's end {}",
            as_of, start
        )));
    }

    log::info!(
        "{} backup of {:?} over [{}, {}) to {:?}",
        if start.is_empty() { "full" } else { "incremental" },
        options.dataset,
        start,
        end,
        options.dest
    );

    let mut tasks = Vec::new();
    for range in store.ranges()? {
        for span in &spans {
            if let Some(piece) = range.span.intersect(span) {
                tasks.push(ExportTask {
                    index: tasks.len(),
                    range: range.clone(),
                    span: piece,
                });
            }
        }
    }

    let data_dir = options.dest.join(DATA_DIR);
    fs::create_dir_all(&data_dir)?;

    let metrics = Metrics::new();
    let scanner = TimeBoundScanner::new(
        store,
        ScanOptions {
            time_bound: config.time_bound_scans,
        },
        config.retry,
        &metrics,
    )
    .with_cancel(&options.cancel);

    let manifest = Mutex::new(BackupManifest::new(options.dataset.clone(), start, end, spans));
    let staged: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    let results = run_parallel(&tasks, config.worker_threads, &options.cancel, |task| {
        let file_name = format!("{:06}.sst", task.index);
        let path = data_dir.join(&file_name);
        let exported = scanner
            .scan_with(&task.range, &task.span, start, end, |scan| {
                export_span(scan, &path, config.sync_writes)
            })
            .map_err(|e| ArchivistError::operation_failed("backup", task.range.id, e))?;

        if let Some(meta) = exported {
            staged.lock().map_err(|_| ArchivistError::Poisoned("backup"))?.push(path);
            metrics.record_file_written(meta.size);
            log::debug!(
                "range {} {}: exported {} revisions ({} bytes)",
                task.range.id,
                task.span,
                meta.footer.entry_count,
                meta.size
            );
            manifest
                .lock()
                .map_err(|_| ArchivistError::Poisoned("backup"))?
                .add_entry(ManifestEntry {
                    start_key: task.span.start.clone(),
                    end_key: task.span.end.clone(),
                    file_ref: Some(format!("{}/{}", DATA_DIR, file_name)),
                    byte_size: meta.size,
                    entry_count: meta.footer.entry_count,
                    checksum: meta.checksum,
                });
        }
        Ok(())
    });

    let published = first_error(results).and_then(|_| {
        options.cancel.check()?;
        let mut manifest = manifest
            .into_inner()
            .map_err(|_| ArchivistError::Poisoned("backup"))?;
        manifest.seal();
        let path = manifest.write(&options.dest)?;
        Ok((path, manifest))
    });

    match published {
        Ok((manifest_path, manifest)) => {
            let metrics = metrics.snapshot();
            log::info!(
                "backup of {:?} complete: {} files, {} bytes, {} ranges skipped",
                options.dataset,
                metrics.files_written,
                manifest.total_size,
                metrics.ranges_skipped
            );
            Ok(BackupOutcome {
                manifest_path,
                total_size: manifest.total_size,
                manifest,
                metrics,
            })
        }
        Err(err) => {
            log::warn!("backup of {:?} aborted: {}", options.dataset, err);
            let staged = staged.into_inner().unwrap_or_default();
            discard(&data_dir, &staged);
            Err(err)
        }
    }
}

/// Write the revisions of `scan` to `path`.
/// No file is created when nothing qualifies.
fn export_span<I>(scan: I, path: &Path, sync: bool) -> Result<Option<DataFileMeta>>
where
    I: Iterator<Item = Result<KeyRevision>>,
{
    let mut writer: Option<DataFileWriter> = None;
    let result = write_revisions(scan, path, sync, &mut writer);

    match (result, writer) {
        (Ok(()), Some(w)) => w.finish().map(Some).map_err(|e| {
            let _ = fs::remove_file(path);
            e
        }),
        (Ok(()), None) => Ok(None),
        (Err(err), w) => {
            drop(w);
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}

fn write_revisions<I>(scan: I, path: &Path, sync: bool, writer: &mut Option<DataFileWriter>) -> Result<()>
where
    I: Iterator<Item = Result<KeyRevision>>,
{
    for rev in scan {
        let rev = rev?;
        if writer.is_none() {
            *writer = Some(DataFileWriter::create(path, sync)?);
        }
        if let Some(w) = writer.as_mut() {
            w.add(&rev)?;
        }
    }
    Ok(())
}

fn discard(data_dir: &Path, staged: &[PathBuf]) {
    for path in staged {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("failed to remove staged file {:?}: {}", path, e);
        }
    }
    // Only succeeds if nothing else lives there.
    let _ = fs::remove_dir(data_dir);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Store;
    use crate::retry::RetryPolicy;

    fn open_store(dir: &Path) -> (Store, Config) {
        let config = Config::new(dir.join("store"))
            .with_sync_writes(false)
            .with_worker_threads(2)
            .with_retry(RetryPolicy::no_retry());
        (Store::open(config.clone()).unwrap(), config)
    }

    #[test]
    fn test_full_backup_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.split_at(b"m").unwrap();
        store.put(b"x".to_vec(), b"2".to_vec()).unwrap();
        store.split_at(b"y").unwrap();

        let dest = dir.path().join("full");
        let outcome = backup(&store, &config, &BackupOptions::new("kv", &dest)).unwrap();

        assert_eq!(outcome.manifest.files().count(), 2);
        assert!(outcome.total_size > 0);
        assert_eq!(outcome.manifest.entries.len(), 3);
        assert!(outcome.manifest.is_full());
        assert_eq!(BackupManifest::read(&dest).unwrap(), outcome.manifest);
        for entry in outcome.manifest.files() {
            assert!(dest.join(entry.file_ref.as_ref().unwrap()).is_file());
        }
    }

    #[test]
    fn test_backup_includes_writes_at_as_of() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let as_of = store.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"c".to_vec(), b"3".to_vec()).unwrap();

        let dest = dir.path().join("full");
        let outcome = backup(&store, &config, &BackupOptions::new("kv", &dest).with_as_of(as_of)).unwrap();
        let entry_count: u64 = outcome.manifest.files().map(|e| e.entry_count).sum();
        assert_eq!(entry_count, 2);
        assert_eq!(outcome.manifest.end_timestamp, as_of.next());
    }

    #[test]
    fn test_incremental_at_base_as_of_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        let as_of = store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"b".to_vec(), b"2".to_vec()).unwrap();

        let base = dir.path().join("base");
        backup(&store, &config, &BackupOptions::new("kv", &base).with_as_of(as_of)).unwrap();
        let options = BackupOptions::new("kv", dir.path().join("inc"))
            .incremental_from(&base)
            .with_as_of(as_of);
        let outcome = backup(&store, &config, &options).unwrap();
        assert_eq!(outcome.total_size, 0);
        assert_eq!(outcome.manifest.files().count(), 0);
        assert_eq!(outcome.manifest.start_timestamp, outcome.manifest.end_timestamp);

        // Going backwards is still refused.
        let options = BackupOptions::new("kv", dir.path().join("back"))
            .incremental_from(&base)
            .with_as_of(as_of.prev());
        assert!(matches!(
            backup(&store, &config, &options),
            Err(ArchivistError::Consistency(_))
        ));
    }

    #[test]
    fn test_rejects_unresolved_as_of() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        let future = Timestamp::new(store.clock().now().unwrap().wall_time + 3_600_000_000_000, 0);
        let options = BackupOptions::new("kv", dir.path().join("full")).with_as_of(future);
        assert!(matches!(
            backup(&store, &config, &options),
            Err(ArchivistError::Consistency(_))
        ));
    }

    #[test]
    fn test_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        let dest = dir.path().join("full");
        backup(&store, &config, &BackupOptions::new("kv", &dest)).unwrap();
        assert!(matches!(
            backup(&store, &config, &BackupOptions::new("kv", &dest)),
            Err(ArchivistError::Consistency(_))
        ));
    }

    #[test]
    fn test_incremental_requires_matching_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        let base = dir.path().join("base");
        backup(&store, &config, &BackupOptions::new("kv", &base)).unwrap();
        let options = BackupOptions::new("other", dir.path().join("inc")).incremental_from(&base);
        assert!(matches!(
            backup(&store, &config, &options),
            Err(ArchivistError::Consistency(_))
        ));
    }

    #[test]
    fn test_cancelled_backup_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = open_store(dir.path());
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let dest = dir.path().join("full");
        let options = BackupOptions::new("kv", &dest).with_cancel(cancel);
        assert!(matches!(
            backup(&store, &config, &options),
            Err(ArchivistError::Cancelled)
        ));
        assert!(!manifest::exists(&dest));
        assert!(!dest.join(DATA_DIR).exists());
    }
}
