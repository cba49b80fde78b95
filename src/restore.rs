//! ARCHIVIST - Restore Ingester
//! Re-introduces a backup chain into a store as bulk file additions.
//!
//! ## Algorithm
//! 1. Read every manifest of the chain and validate it as a whole
//!    (continuity, dataset, spans, coverage)
//! 2. Check that every referenced DataFile exists with its recorded size
//! 3. Advance the destination clock to the chain's end timestamp
//! 4. For each destination range, add every chain file overlapping it in
//!    one atomic ingest, ranges in parallel, transient failures retried.
//!    A range that split after planning is re-resolved and each piece gets
//!    the files overlapping it.
//!
//! Steps 1-3 fail before any range is touched. If a range fails terminally
//! or the restore is cancelled, files this run attached are unlinked again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::Config;
use crate::engine::metrics::{Metrics, MetricsSnapshot};
use crate::engine::range::RangeDescriptor;
use crate::engine::{IngestFile, RangeStore};
use crate::error::{ArchivistError, Result};
use crate::manifest::{backup_dir, validate_chain, BackupManifest, ManifestEntry};
use crate::pool::{first_error, run_parallel, CancelToken};
use crate::types::{KeySpan, RangeId, Timestamp};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// If set, every manifest of the chain must name this dataset.
    pub dataset: Option<String>,
    pub cancel: CancelToken,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// End timestamp of the restored chain.
    pub end: Timestamp,
    /// Ranges that received at least one file.
    pub ranges: usize,
    pub files_added: usize,
    /// Files the destination already held.
    pub files_skipped: usize,
    pub metrics: MetricsSnapshot,
}

/// A manifest together with the directory its file references resolve in.
struct ChainStep {
    dir: PathBuf,
    manifest: BackupManifest,
}

struct IngestPlan {
    range: RangeDescriptor,
    /// Chain files overlapping the range in chain order, with their key span.
    files: Vec<(KeySpan, IngestFile)>,
}

impl IngestPlan {
    fn files_for(&self, target: &RangeDescriptor) -> Vec<IngestFile> {
        self.files
            .iter()
            .filter(|(span, _)| span.overlaps(&target.span))
            .map(|(_, file)| file.clone())
            .collect()
    }
}

/// Restore the backup chain `chain` (full backup first) into `store`.
pub fn restore<S: RangeStore + ?Sized>(
    store: &S,
    config: &Config,
    chain: &[PathBuf],
    options: &RestoreOptions,
) -> Result<RestoreOutcome> {
    config.validate()?;
    let steps = load_chain(chain)?;
    let headers: Vec<_> = steps.iter().map(|s| s.manifest.header()).collect();
    validate_chain(&headers)?;

    if let Some(dataset) = &options.dataset {
        if &headers[0].dataset != dataset {
            return Err(ArchivistError::Consistency(format!(
                "chain backs up dataset {:?}, not {:?}",
                headers[0].dataset, dataset
            )));
        }
    }
    verify_files(&steps)?;

    let end = headers[headers.len() - 1].end;
    store.clock().update(end)?;

    let plans = plan(store, &steps)?;
    log::info!(
        "restoring {} manifests ending at {} into {} ranges",
        steps.len(),
        end,
        plans.len()
    );

    let metrics = Metrics::new();
    let attached: Mutex<Vec<(RangeId, Vec<String>)>> = Mutex::new(Vec::new());

    let results = run_parallel(&plans, config.worker_threads, &options.cancel, |plan| {
        let id = plan.range.id;
        let label = format!("ingest into range {}", id);
        let mut added = 0usize;
        let (skipped, added_last) = config
            .retry
            .run(
                &label,
                |attempt| {
                    let targets = if attempt == 0 {
                        vec![plan.range.clone()]
                    } else {
                        store.ranges_overlapping(&plan.range.span)?
                    };
                    let (mut skipped, mut added_now) = (0, 0);
                    for target in &targets {
                        let files = plan.files_for(target);
                        if files.is_empty() {
                            continue;
                        }
                        let outcome = store.ingest(target, &files)?;
                        skipped += outcome.skipped;
                        if !outcome.added.is_empty() {
                            added_now += outcome.added.len();
                            attached
                                .lock()
                                .map_err(|_| ArchivistError::Poisoned("restore"))?
                                .push((target.id, outcome.added));
                        }
                    }
                    added += added_now;
                    Ok((skipped, added_now))
                },
                || metrics.record_retry(),
            )
            .map_err(|e| ArchivistError::operation_failed("restore", id, e))?;

        // Files attached by an earlier, failed attempt come back as skipped.
        let skipped = skipped.saturating_sub(added - added_last);
        metrics.record_ingest(added, skipped);
        Ok((added, skipped))
    });

    let totals = first_error(results).and_then(|totals| {
        options.cancel.check()?;
        Ok(totals)
    });

    match totals {
        Ok(totals) => {
            let metrics = metrics.snapshot();
            let outcome = RestoreOutcome {
                end,
                ranges: plans.len(),
                files_added: totals.iter().map(|t| t.0).sum(),
                files_skipped: totals.iter().map(|t| t.1).sum(),
                metrics,
            };
            log::info!(
                "restore complete: {} files added, {} already present",
                outcome.files_added,
                outcome.files_skipped
            );
            Ok(outcome)
        }
        Err(err) => {
            log::warn!("restore aborted: {}", err);
            let attached = attached.into_inner().unwrap_or_default();
            for (id, files) in attached {
                if let Err(e) = store.unlink(id, &files) {
                    log::error!("range {}: failed to unlink restored files: {}", id, e);
                }
            }
            Err(err)
        }
    }
}

fn load_chain(chain: &[PathBuf]) -> Result<Vec<ChainStep>> {
    chain
        .iter()
        .map(|location| {
            let manifest = BackupManifest::read(location).map_err(|e| {
                ArchivistError::Consistency(format!("cannot read manifest at {:?}: {}", location, e))
            })?;
            Ok(ChainStep {
                dir: backup_dir(location),
                manifest,
            })
        })
        .collect()
}

fn file_path(dir: &Path, entry: &ManifestEntry) -> Option<PathBuf> {
    entry.file_ref.as_ref().map(|f| dir.join(f))
}

fn verify_files(steps: &[ChainStep]) -> Result<()> {
    for step in steps {
        for entry in step.manifest.files() {
            let Some(path) = file_path(&step.dir, entry) else {
                continue;
            };
            let size = fs::metadata(&path).map(|m| m.len()).map_err(|e| {
                ArchivistError::Consistency(format!("backup file {:?} unavailable: {}", path, e))
            })?;
            if size != entry.byte_size {
                return Err(ArchivistError::Consistency(format!(
                    "backup file {:?} is {} bytes, manifest records {}",
                    path, size, entry.byte_size
                )));
            }
        }
    }
    Ok(())
}

/// Stable identity of a backup file, independent of where it is read from.
fn file_id(entry: &ManifestEntry, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{:08x}-{}-{}", entry.checksum, entry.byte_size, name)
}

fn plan<S: RangeStore + ?Sized>(store: &S, steps: &[ChainStep]) -> Result<Vec<IngestPlan>> {
    let mut plans = Vec::new();
    for range in store.ranges()? {
        let mut files = Vec::new();
        // Chain order: base files first, newest incremental last.
        for step in steps {
            for entry in step.manifest.files() {
                if !entry.span().overlaps(&range.span) {
                    continue;
                }
                if let Some(path) = file_path(&step.dir, entry) {
                    let file = IngestFile {
                        id: file_id(entry, &path),
                        path,
                        size: entry.byte_size,
                        checksum: entry.checksum,
                    };
                    files.push((entry.span(), file));
                }
            }
        }
        if !files.is_empty() {
            plans.push(IngestPlan { range, files });
        }
    }
    Ok(plans)
}
