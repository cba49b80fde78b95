//! ARCHIVIST - MemTable (In-Memory MVCC Buffer)
//! Holds the revisions written to one range through the ordinary write path.
//! Bulk-ingested DataFiles live beside it, not inside it.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{Key, KeyRevision, Timestamp, TimestampSpan, Value};

/// In-memory sorted revision store backed by a BTreeMap.
/// Entries are keyed by (key, timestamp) so every revision of a key
/// is kept, in ascending timestamp order.
pub struct MemTable {
    /// A `None` value represents a tombstone (deletion marker).
    entries: BTreeMap<(Key, Timestamp), Option<Value>>,
    /// Current approximate size in bytes.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Returns the number of revisions in the MemTable.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a revision. Rewriting the same (key, timestamp) replaces
    /// the old revision.
    pub fn apply(&mut self, rev: KeyRevision) {
        let entry_size = rev.size();
        let KeyRevision {
            key,
            timestamp,
            value,
        } = rev;
        if let Some(old) = self.entries.insert((key.clone(), timestamp), value) {
            let old_size = key.len() + old.as_ref().map_or(0, |v| v.len()) + 12;
            self.size_bytes = self.size_bytes.saturating_sub(old_size);
        }
        self.size_bytes += entry_size;
    }

    /// The newest revision of `key` with timestamp <= `as_of`.
    pub fn get_revision(&self, key: &[u8], as_of: Timestamp) -> Option<KeyRevision> {
        let lo = (key.to_vec(), Timestamp::ZERO);
        let hi = (key.to_vec(), as_of);
        self.entries
            .range((Bound::Included(lo), Bound::Included(hi)))
            .next_back()
            .map(|((k, ts), v)| KeyRevision {
                key: k.clone(),
                timestamp: *ts,
                value: v.clone(),
            })
    }

    /// Iterate all revisions in (key, timestamp) order.
    pub fn revisions(&self) -> impl Iterator<Item = KeyRevision> + '_ {
        self.entries.iter().map(|((k, ts), v)| KeyRevision {
            key: k.clone(),
            timestamp: *ts,
            value: v.clone(),
        })
    }

    /// Smallest and largest timestamp currently held.
    pub fn timestamp_span(&self) -> Option<TimestampSpan> {
        let mut span: Option<TimestampSpan> = None;
        for (_, ts) in self.entries.keys() {
            match span.as_mut() {
                Some(s) => s.extend(*ts),
                None => span = Some(TimestampSpan::point(*ts)),
            }
        }
        span
    }

    /// Move every revision with key >= `split_key` into a new MemTable.
    pub fn split_off(&mut self, split_key: &[u8]) -> MemTable {
        let right = self
            .entries
            .split_off(&(split_key.to_vec(), Timestamp::ZERO));
        let right_size: usize = right
            .iter()
            .map(|((k, _), v)| k.len() + v.as_ref().map_or(0, |v| v.len()) + 12)
            .sum();
        self.size_bytes = self.size_bytes.saturating_sub(right_size);
        MemTable {
            entries: right,
            size_bytes: right_size,
        }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
