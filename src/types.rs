//! ARCHIVIST - Core Type Definitions
//! Defines fundamental types used across the storage, backup and load paths.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Using Vec<u8> allows arbitrary binary values.
pub type Value = Vec<u8>;

/// Smallest possible key (inclusive lower bound of the key space).
pub const KEY_MIN: &[u8] = &[];

/// Exclusive upper bound of the key space. User keys sort strictly below it.
pub const KEY_MAX: &[u8] = &[0xff, 0xff];

/// Hybrid logical clock value: wall time in nanoseconds plus a logical
/// counter that orders events sharing the same wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: u32,
}

impl Timestamp {
    /// The epoch. Full backups start here.
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    /// Largest representable timestamp.
    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: u32::MAX,
    };

    pub fn new(wall_time: i64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::ZERO
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Self {
        if self.logical == u32::MAX {
            Self::new(self.wall_time.saturating_add(1), 0)
        } else {
            Self::new(self.wall_time, self.logical + 1)
        }
    }

    /// The largest timestamp strictly smaller than `self` (saturates at ZERO).
    pub fn prev(&self) -> Self {
        if self.logical > 0 {
            Self::new(self.wall_time, self.logical - 1)
        } else if self.wall_time > 0 {
            Self::new(self.wall_time - 1, u32::MAX)
        } else {
            Self::ZERO
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_time, self.logical)
    }
}

/// Inclusive [min, max] timestamps observed by a range or file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSpan {
    pub min: Timestamp,
    pub max: Timestamp,
}

impl TimestampSpan {
    pub fn point(ts: Timestamp) -> Self {
        Self { min: ts, max: ts }
    }

    /// Widen the span to include `ts`.
    pub fn extend(&mut self, ts: Timestamp) {
        self.min = self.min.min(ts);
        self.max = self.max.max(ts);
    }

    pub fn merge(&mut self, other: &TimestampSpan) {
        self.extend(other.min);
        self.extend(other.max);
    }

    /// True if any timestamp in `[lo, hi)` falls inside this span.
    pub fn intersects(&self, lo: Timestamp, hi: Timestamp) -> bool {
        lo < hi && self.min < hi && self.max >= lo
    }
}

/// Widen an optional span with another optional span.
pub fn merge_spans(a: Option<TimestampSpan>, b: Option<TimestampSpan>) -> Option<TimestampSpan> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.merge(&b);
            Some(a)
        }
        (a, None) => a,
        (None, b) => b,
    }
}

/// Identifier of a range inside a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeId(pub u64);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A half-open key interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeySpan {
    pub start: Key,
    pub end: Key,
}

impl KeySpan {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(KEY_MIN.to_vec(), KEY_MAX.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }

    pub fn overlaps(&self, other: &KeySpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The overlap of two spans, if non-empty.
    pub fn intersect(&self, other: &KeySpan) -> Option<KeySpan> {
        let start = self.start.clone().max(other.start.clone());
        let end = self.end.clone().min(other.end.clone());
        let span = KeySpan { start, end };
        (!span.is_empty()).then_some(span)
    }

    /// True if `other` lies entirely within `self`.
    pub fn covers(&self, other: &KeySpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for KeySpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", pretty_key(&self.start), pretty_key(&self.end))
    }
}

/// Render a key for log and error messages: printable ASCII as is,
/// everything else as `\xNN`.
pub fn pretty_key(key: &[u8]) -> String {
    if key == KEY_MAX {
        return "/Max".to_string();
    }
    if key.is_empty() {
        return "/Min".to_string();
    }
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if b.is_ascii_graphic() {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

/// Sort a list of spans and merge touching or overlapping neighbours.
pub fn normalize_spans(mut spans: Vec<KeySpan>) -> Vec<KeySpan> {
    spans.retain(|s| !s.is_empty());
    spans.sort();
    let mut out: Vec<KeySpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match out.last_mut() {
            Some(last) if span.start <= last.end => {
                if span.end > last.end {
                    last.end = span.end;
                }
            }
            _ => out.push(span),
        }
    }
    out
}

/// A single revision of a key.
/// A `None` value indicates a tombstone (deletion marker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRevision {
    pub key: Key,
    pub timestamp: Timestamp,
    pub value: Option<Value>,
}

impl KeyRevision {
    /// Create a revision carrying a value (PUT operation).
    pub fn put(key: Key, timestamp: Timestamp, value: Value) -> Self {
        Self {
            key,
            timestamp,
            value: Some(value),
        }
    }

    /// Create a tombstone revision (DELETE operation).
    pub fn tombstone(key: Key, timestamp: Timestamp) -> Self {
        Self {
            key,
            timestamp,
            value: None,
        }
    }

    /// Returns true if this revision is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Logical size: key + value + 12 bytes of timestamp.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len()) + 12
    }

    /// Order by key ascending, then timestamp ascending.
    pub fn cmp_order(&self, other: &KeyRevision) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(10, 1);
        let c = Timestamp::new(11, 0);
        assert!(a < b && b < c);
        assert_eq!(a.next(), b);
        assert_eq!(c.prev(), Timestamp::new(10, u32::MAX));
        assert_eq!(Timestamp::ZERO.prev(), Timestamp::ZERO);
    }

    #[test]
    fn test_timestamp_span_intersects() {
        let span = TimestampSpan {
            min: Timestamp::new(5, 0),
            max: Timestamp::new(9, 0),
        };
        assert!(span.intersects(Timestamp::ZERO, Timestamp::new(6, 0)));
        assert!(span.intersects(Timestamp::new(9, 0), Timestamp::new(20, 0)));
        assert!(!span.intersects(Timestamp::new(9, 1), Timestamp::new(20, 0)));
        assert!(!span.intersects(Timestamp::ZERO, Timestamp::new(5, 0)));
        assert!(!span.intersects(Timestamp::new(7, 0), Timestamp::new(7, 0)));
    }

    #[test]
    fn test_key_span_ops() {
        let a = KeySpan::new(b"a".to_vec(), b"m".to_vec());
        let b = KeySpan::new(b"k".to_vec(), b"z".to_vec());
        let c = KeySpan::new(b"m".to_vec(), b"z".to_vec());

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // half-open: "m" is not in a
        assert!(a.contains(b"a") && !a.contains(b"m"));
        assert_eq!(a.intersect(&b), Some(KeySpan::new(b"k".to_vec(), b"m".to_vec())));
        assert_eq!(a.intersect(&c), None);
        assert!(KeySpan::full().covers(&a));
    }

    #[test]
    fn test_normalize_spans() {
        let spans = vec![
            KeySpan::new(b"m".to_vec(), b"z".to_vec()),
            KeySpan::new(b"a".to_vec(), b"f".to_vec()),
            KeySpan::new(b"f".to_vec(), b"m".to_vec()),
            KeySpan::new(b"q".to_vec(), b"q".to_vec()),
        ];
        assert_eq!(
            normalize_spans(spans),
            vec![KeySpan::new(b"a".to_vec(), b"z".to_vec())]
        );
    }

    #[test]
    fn test_pretty_key() {
        assert_eq!(pretty_key(b"abc"), "abc");
        assert_eq!(pretty_key(&[0x10, b'a']), "\\x10a");
        assert_eq!(pretty_key(KEY_MAX), "/Max");
    }
}
