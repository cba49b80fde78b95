//! ARCHIVIST - Backup Manifest
//! Durable description of a backup or bulk load: the timestamp interval it
//! captures, the key space it covers and the DataFiles holding its revisions.
//!
//! ## On-disk format
//! `BACKUP_MANIFEST` in the backup directory, JSON:
//! ```text
//! { formatVersion, dataset, startTimestamp, endTimestamp, spans,
//!   entries: [{ startKey, endKey, fileRef, byteSize, entryCount, checksum }],
//!   totalSize }
//! ```
//! A manifest is published with write-then-rename, so it is either fully
//! present or absent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{ArchivistError, Result};
use crate::types::{normalize_spans, Key, KeySpan, Timestamp};

/// Name of the manifest file inside a backup directory.
pub const MANIFEST_FILE: &str = "BACKUP_MANIFEST";

pub const FORMAT_VERSION: u32 = 1;

/// One key interval of a backup and the file holding its revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub start_key: Key,
    pub end_key: Key,
    /// Path of the DataFile relative to the backup directory. `None` for an
    /// interval a full backup covers but found empty.
    pub file_ref: Option<String>,
    pub byte_size: u64,
    pub entry_count: u64,
    /// CRC32 of the whole DataFile.
    pub checksum: u32,
}

impl ManifestEntry {
    /// An interval covered without any data.
    pub fn empty(span: KeySpan) -> Self {
        Self {
            start_key: span.start,
            end_key: span.end,
            file_ref: None,
            byte_size: 0,
            entry_count: 0,
            checksum: 0,
        }
    }

    pub fn span(&self) -> KeySpan {
        KeySpan::new(self.start_key.clone(), self.end_key.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub format_version: u32,
    pub dataset: String,
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    /// Key space this backup was taken over.
    pub spans: Vec<KeySpan>,
    pub entries: Vec<ManifestEntry>,
    pub total_size: u64,
}

/// The parts of a manifest chain validation looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHeader {
    pub dataset: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub spans: Vec<KeySpan>,
    pub entries: Vec<KeySpan>,
}

impl BackupManifest {
    pub fn new(dataset: impl Into<String>, start: Timestamp, end: Timestamp, spans: Vec<KeySpan>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            dataset: dataset.into(),
            start_timestamp: start,
            end_timestamp: end,
            spans: normalize_spans(spans),
            entries: Vec::new(),
            total_size: 0,
        }
    }

    /// True for a full backup (or bulk load), false for an incremental.
    pub fn is_full(&self) -> bool {
        self.start_timestamp.is_empty()
    }

    pub fn add_entry(&mut self, entry: ManifestEntry) {
        self.total_size += entry.byte_size;
        self.entries.push(entry);
    }

    /// Sort entries by key and, for full manifests, add empty entries for
    /// any part of `spans` no entry covers.
    pub fn seal(&mut self) {
        self.entries.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        if !self.is_full() {
            return;
        }
        let mut gaps = Vec::new();
        for span in &self.spans {
            let mut cursor = span.start.clone();
            for entry in self.entries.iter().filter(|e| span.overlaps(&e.span())) {
                if entry.start_key > cursor {
                    gaps.push(ManifestEntry::empty(KeySpan::new(cursor.clone(), entry.start_key.clone())));
                }
                if entry.end_key > cursor {
                    cursor = entry.end_key.clone();
                }
            }
            if cursor < span.end {
                gaps.push(ManifestEntry::empty(KeySpan::new(cursor, span.end.clone())));
            }
        }
        self.entries.extend(gaps);
        self.entries.sort_by(|a, b| a.start_key.cmp(&b.start_key));
    }

    pub fn header(&self) -> ManifestHeader {
        ManifestHeader {
            dataset: self.dataset.clone(),
            start: self.start_timestamp,
            end: self.end_timestamp,
            spans: self.spans.clone(),
            entries: self.entries.iter().map(|e| e.span()).collect(),
        }
    }

    /// Entries that reference a DataFile.
    pub fn files(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.file_ref.is_some())
    }

    /// Atomically publish the manifest into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json)?;
        log::info!(
            "manifest written to {:?} ({} entries, {} bytes of data)",
            path,
            self.entries.len(),
            self.total_size
        );
        Ok(path)
    }

    /// Read the manifest of a backup directory (or a manifest file path).
    pub fn read(location: &Path) -> Result<Self> {
        let path = manifest_path(location);
        let bytes = fs::read(&path)?;
        let manifest: BackupManifest = serde_json::from_slice(&bytes)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ArchivistError::Corruption(format!(
                "{:?}: unsupported manifest format version {}",
                path, manifest.format_version
            )));
        }
        Ok(manifest)
    }
}

/// Resolve a backup directory or a manifest file to the manifest file.
pub fn manifest_path(location: &Path) -> PathBuf {
    if location.is_dir() {
        location.join(MANIFEST_FILE)
    } else {
        location.to_path_buf()
    }
}

/// Directory a manifest's relative file references resolve against.
pub fn backup_dir(location: &Path) -> PathBuf {
    if location.is_dir() {
        location.to_path_buf()
    } else {
        location
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// True if `dir` already holds a published manifest.
pub fn exists(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
}

/// Write `contents` to `path` via a synced temporary file in the same
/// directory, renamed into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| ArchivistError::Io(err.error))?;
    Ok(())
}

fn inconsistent(msg: String) -> ArchivistError {
    ArchivistError::Consistency(msg)
}

/// Check that an ordered chain (full backup first, then incrementals) can
/// be layered into one consistent dataset.
///
/// Rules:
/// - the chain is non-empty and starts with a full backup (start = 0)
/// - the base has start < end; an incremental may be empty (start = end)
/// - every step starts where the previous one ended
/// - every step names the same dataset and key spans as the base
/// - within a step, entries are sorted, disjoint and inside the spans
/// - the base's entries tile its spans exactly
pub fn validate_chain(chain: &[ManifestHeader]) -> Result<()> {
    let base = chain
        .first()
        .ok_or_else(|| inconsistent("empty manifest chain".into()))?;
    if !base.start.is_empty() {
        return Err(inconsistent(format!(
            "chain must begin with a full backup, first step starts at {}",
            base.start
        )));
    }

    for (i, step) in chain.iter().enumerate() {
        if step.start > step.end || (i == 0 && step.start == step.end) {
            return Err(inconsistent(format!(
                "step {}: empty or inverted interval [{}, {})",
                i, step.start, step.end
            )));
        }
        if i > 0 {
            let prev = &chain[i - 1];
            if step.start != prev.end {
                return Err(inconsistent(format!(
                    "step {} starts at {} but step {} ended at {}",
                    i,
                    step.start,
                    i - 1,
                    prev.end
                )));
            }
            if step.dataset != base.dataset {
                return Err(inconsistent(format!(
                    "step {} backs up dataset {:?}, base is {:?}",
                    i, step.dataset, base.dataset
                )));
            }
            if step.spans != base.spans {
                return Err(inconsistent(format!(
                    "step {} covers different key spans than the base",
                    i
                )));
            }
        }
        check_entries(i, step)?;
    }

    check_tiling(base)
}

fn check_entries(i: usize, step: &ManifestHeader) -> Result<()> {
    for pair in step.entries.windows(2) {
        if pair[0].end > pair[1].start {
            return Err(inconsistent(format!(
                "step {}: entries {} and {} overlap",
                i, pair[0], pair[1]
            )));
        }
    }
    for entry in &step.entries {
        if entry.is_empty() || !step.spans.iter().any(|s| s.covers(entry)) {
            return Err(inconsistent(format!(
                "step {}: entry {} lies outside the backed-up key space",
                i, entry
            )));
        }
    }
    Ok(())
}

fn check_tiling(base: &ManifestHeader) -> Result<()> {
    for span in &base.spans {
        let mut cursor = span.start.clone();
        for entry in base.entries.iter().filter(|e| span.covers(e)) {
            if entry.start != cursor {
                return Err(inconsistent(format!(
                    "base backup leaves {} uncovered",
                    KeySpan::new(cursor, entry.start.clone())
                )));
            }
            cursor = entry.end.clone();
        }
        if cursor != span.end {
            return Err(inconsistent(format!(
                "base backup leaves {} uncovered",
                KeySpan::new(cursor, span.end.clone())
            )));
        }
    }
    Ok(())
}
