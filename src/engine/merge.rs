//! ARCHIVIST - K-Way Merge
//! Merges sorted revision streams into one sorted stream.
//!
//! Used by range reads (MemTable + ingested files) and by the bulk
//! loader's merge phase (sorted runs -> final DataFiles).
//!
//! ## Algorithm
//! 1. Pull the head of every source into a min-heap keyed by (key, ts, source).
//! 2. Pop the smallest, refill from the source it came from.
//! 3. Identical (key, ts) pairs from different sources are either
//!    collapsed (the lowest source index wins) or rejected.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{ArchivistError, Result};
use crate::types::{pretty_key, Key, KeyRevision, Timestamp};

/// A boxed, sendable stream of revisions.
pub type RevisionIter = Box<dyn Iterator<Item = Result<KeyRevision>> + Send>;

/// What to do when two sources carry the same (key, timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the revision from the lowest-indexed source.
    KeepFirst,
    /// Yield an error naming the key.
    Reject,
}

struct HeapEntry {
    rev: KeyRevision,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so BinaryHeap (a max-heap) pops the smallest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rev
            .cmp_order(&self.rev)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Sorted merge over several sorted revision streams.
pub struct MergeIter {
    sources: Vec<RevisionIter>,
    heap: BinaryHeap<HeapEntry>,
    policy: DuplicatePolicy,
    last: Option<(Key, Timestamp)>,
    started: bool,
    pending_error: Option<ArchivistError>,
    failed: bool,
}

impl MergeIter {
    pub fn new(sources: Vec<RevisionIter>, policy: DuplicatePolicy) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            policy,
            last: None,
            started: false,
            pending_error: None,
            failed: false,
        }
    }

    fn refill(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok(rev)) => self.heap.push(HeapEntry { rev, source }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIter {
    type Item = Result<KeyRevision>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.started {
            self.started = true;
            for i in 0..self.sources.len() {
                self.refill(i);
            }
        }

        loop {
            if let Some(err) = self.pending_error.take() {
                self.failed = true;
                return Some(Err(err));
            }
            let entry = self.heap.pop()?;
            self.refill(entry.source);

            if let Some((last_key, last_ts)) = &self.last {
                if *last_key == entry.rev.key && *last_ts == entry.rev.timestamp {
                    match self.policy {
                        DuplicatePolicy::KeepFirst => continue,
                        DuplicatePolicy::Reject => {
                            self.failed = true;
                            return Some(Err(ArchivistError::Input {
                                statement: None,
                                message: format!(
                                    "duplicate key {}",
                                    pretty_key(&entry.rev.key)
                                ),
                            }));
                        }
                    }
                }
            }
            self.last = Some((entry.rev.key.clone(), entry.rev.timestamp));
            return Some(Ok(entry.rev));
        }
    }
}
