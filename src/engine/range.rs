//! ARCHIVIST - Range
//! A contiguous slice of the key space: the revisions written to it
//! through the ordinary write path plus the DataFiles bulk-added to it.
//!
//! Each range keeps a summary of the smallest and largest write timestamp
//! it has observed. Time-bound scans use it to skip ranges wholesale.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    merge_spans, KeyRevision, KeySpan, RangeId, Timestamp, TimestampSpan,
};

use super::datafile::{DataFileFooter, DataFileReader};
use super::memtable::MemTable;
use super::merge::{DuplicatePolicy, MergeIter, RevisionIter};

/// Identity and bounds of a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDescriptor {
    pub id: RangeId,
    pub span: KeySpan,
}

/// A DataFile owned by the store and attached to one or more ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedFile {
    pub id: String,
    pub path: PathBuf,
    pub footer: DataFileFooter,
}

impl IngestedFile {
    /// True if the file may hold keys inside `span`.
    fn may_overlap(&self, span: &KeySpan) -> bool {
        match (&self.footer.first_key, &self.footer.last_key) {
            (Some(first), Some(last)) => {
                first.as_slice() < span.end.as_slice() && last.as_slice() >= span.start.as_slice()
            }
            _ => false,
        }
    }

    /// True if the file may hold revisions in `[lo, hi)`.
    fn may_intersect(&self, lo: Timestamp, hi: Timestamp) -> bool {
        self.footer
            .ts_bounds
            .map_or(false, |b| b.intersects(lo, hi))
    }
}

pub struct Range {
    id: RangeId,
    span: KeySpan,
    memtable: MemTable,
    files: Vec<Arc<IngestedFile>>,
    file_ids: HashSet<String>,
    summary: Option<TimestampSpan>,
}

impl Range {
    pub fn new(id: RangeId, span: KeySpan) -> Self {
        Self {
            id,
            span,
            memtable: MemTable::new(),
            files: Vec::new(),
            file_ids: HashSet::new(),
            summary: None,
        }
    }

    pub fn id(&self) -> RangeId {
        self.id
    }

    pub fn span(&self) -> &KeySpan {
        &self.span
    }

    pub fn descriptor(&self) -> RangeDescriptor {
        RangeDescriptor {
            id: self.id,
            span: self.span.clone(),
        }
    }

    /// Min/max write timestamp observed by this range.
    pub fn timestamp_summary(&self) -> Option<TimestampSpan> {
        self.summary
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn memtable_size(&self) -> usize {
        self.memtable.size()
    }

    pub fn has_file(&self, id: &str) -> bool {
        self.file_ids.contains(id)
    }

    /// Apply a revision from the ordinary write path.
    pub fn apply(&mut self, rev: KeyRevision) {
        self.summary = merge_spans(self.summary, Some(TimestampSpan::point(rev.timestamp)));
        self.memtable.apply(rev);
    }

    /// Attach files that this range does not already hold.
    /// Returns the ids that were actually attached.
    pub fn attach(&mut self, files: Vec<Arc<IngestedFile>>) -> Vec<String> {
        let mut added = Vec::new();
        for file in files {
            if !self.file_ids.insert(file.id.clone()) {
                continue;
            }
            if file.may_overlap(&self.span) {
                self.summary = merge_spans(self.summary, file.footer.ts_bounds);
            }
            added.push(file.id.clone());
            self.files.push(file);
        }
        added
    }

    /// Detach files by id and recompute the timestamp summary.
    pub fn detach(&mut self, ids: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for id in ids {
            if self.file_ids.remove(id) {
                removed.push(id.clone());
            }
        }
        self.files.retain(|f| self.file_ids.contains(&f.id));

        let mut summary = self.memtable.timestamp_span();
        for file in &self.files {
            if file.may_overlap(&self.span) {
                summary = merge_spans(summary, file.footer.ts_bounds);
            }
        }
        self.summary = summary;
        removed
    }

    /// Split at `key`, returning the right-hand half `[key, end)`.
    /// Both halves inherit the full timestamp summary and share the files.
    pub fn split(&mut self, key: &[u8], right_id: RangeId) -> Range {
        let right_span = KeySpan::new(key.to_vec(), self.span.end.clone());
        self.span.end = key.to_vec();
        Range {
            id: right_id,
            span: right_span,
            memtable: self.memtable.split_off(key),
            files: self.files.clone(),
            file_ids: self.file_ids.clone(),
            summary: self.summary,
        }
    }

    /// Sorted stream of this range's revisions.
    ///
    /// With a `[lo, hi)` window, files whose timestamp bounds miss it are
    /// not opened and MemTable revisions outside it are dropped; revisions
    /// inside opened files are still yielded regardless of timestamp.
    pub fn iter(&self, window: Option<(Timestamp, Timestamp)>) -> Result<RevisionIter> {
        let buffered: Vec<KeyRevision> = self
            .memtable
            .revisions()
            .filter(|r| window.map_or(true, |(lo, hi)| r.timestamp >= lo && r.timestamp < hi))
            .collect();

        let mut sources: Vec<RevisionIter> = vec![Box::new(buffered.into_iter().map(Ok))];
        for file in &self.files {
            if !file.may_overlap(&self.span) {
                continue;
            }
            if let Some((lo, hi)) = window {
                if !file.may_intersect(lo, hi) {
                    continue;
                }
            }
            let reader = DataFileReader::open(&file.path)?.with_span(self.span.clone());
            sources.push(Box::new(reader));
        }

        Ok(Box::new(MergeIter::new(sources, DuplicatePolicy::KeepFirst)))
    }

    /// Newest revision of `key` with timestamp <= `as_of`.
    pub fn get(&self, key: &[u8], as_of: Timestamp) -> Result<Option<KeyRevision>> {
        let mut best = self.memtable.get_revision(key, as_of);
        let point = KeySpan::new(key.to_vec(), point_end(key));
        for file in &self.files {
            if !file.may_overlap(&point) {
                continue;
            }
            for rev in DataFileReader::open(&file.path)?.with_span(point.clone()) {
                let rev = rev?;
                if rev.timestamp > as_of {
                    break;
                }
                if best.as_ref().map_or(true, |b| rev.timestamp > b.timestamp) {
                    best = Some(rev);
                }
            }
        }
        Ok(best)
    }
}

/// Immediate successor of `key`.
fn point_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    end.push(0);
    end
}
