//! ARCHIVIST - Time-Bound Range Scanner
//! Streams the revisions of one range whose timestamp lies in `[lo, hi)`.
//!
//! ## Skipping
//! Every range keeps the min/max write timestamp it has observed. With
//! time-bound scans enabled the scanner reads that summary first and, if
//! the interval misses it, yields nothing without touching range data.
//! With them disabled every revision of the range is visited and filtered.
//!
//! ## Splits
//! A scan is planned against a [`RangeDescriptor`]. If the range has since
//! split, the store refuses the stale descriptor with a transient error and
//! [`TimeBoundScanner::scan_with`] re-plans against the ranges now covering
//! the wanted key span.

use crate::engine::merge::RevisionIter;
use crate::engine::metrics::Metrics;
use crate::engine::range::RangeDescriptor;
use crate::engine::RangeStore;
use crate::error::{ArchivistError, Result};
use crate::pool::CancelToken;
use crate::retry::RetryPolicy;
use crate::types::{KeyRevision, KeySpan, Timestamp};

/// Per-call scanner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Consult range timestamp summaries before scanning.
    pub time_bound: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { time_bound: true }
    }
}

pub struct TimeBoundScanner<'a, S: RangeStore + ?Sized> {
    store: &'a S,
    options: ScanOptions,
    retry: RetryPolicy,
    metrics: &'a Metrics,
    cancel: Option<&'a CancelToken>,
}

impl<'a, S: RangeStore + ?Sized> TimeBoundScanner<'a, S> {
    pub fn new(store: &'a S, options: ScanOptions, retry: RetryPolicy, metrics: &'a Metrics) -> Self {
        Self {
            store,
            options,
            retry,
            metrics,
            cancel: None,
        }
    }

    /// Stop yielding revisions once `cancel` is tripped.
    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Lazily scan `range` for revisions with timestamp in `[lo, hi)`.
    pub fn scan(&self, range: &RangeDescriptor, lo: Timestamp, hi: Timestamp) -> Result<RangeScan<'a>> {
        if lo >= hi {
            self.metrics.record_range_skipped();
            return Ok(RangeScan::empty(self.metrics));
        }

        let window = if self.options.time_bound {
            let summary = self.store.timestamp_summary(range.id)?;
            if !summary.map_or(false, |s| s.intersects(lo, hi)) {
                log::debug!(
                    "range {} {}: summary {:?} misses [{}, {}), skipped",
                    range.id,
                    range.span,
                    summary,
                    lo,
                    hi
                );
                self.metrics.record_range_skipped();
                return Ok(RangeScan::empty(self.metrics));
            }
            Some((lo, hi))
        } else {
            None
        };

        self.metrics.record_range_scanned();
        let inner = self.store.iter_range(range, window)?;
        Ok(RangeScan {
            inner: Some(inner),
            lo,
            hi,
            metrics: self.metrics,
            cancel: self.cancel.cloned(),
        })
    }

    /// Scan the part of `span` held by `planned` and hand the stream to
    /// `consume`, retrying the scan and the consumer together while failures
    /// are transient. Retries look up the ranges covering `span` afresh, so a
    /// split between planning and scanning loses nothing.
    pub fn scan_with<T, F>(
        &self,
        planned: &RangeDescriptor,
        span: &KeySpan,
        lo: Timestamp,
        hi: Timestamp,
        mut consume: F,
    ) -> Result<T>
    where
        F: FnMut(SpanScan<'a>) -> Result<T>,
    {
        let label = format!("scan of range {} {}", planned.id, span);
        self.retry.run(
            &label,
            |attempt| {
                let targets = if attempt == 0 {
                    vec![planned.clone()]
                } else {
                    self.store.ranges_overlapping(span)?
                };
                if attempt > 0 {
                    log::debug!("{}: re-planned onto {} ranges", label, targets.len());
                }
                let scans = targets
                    .iter()
                    .map(|range| self.scan(range, lo, hi))
                    .collect::<Result<Vec<_>>>()?;
                consume(SpanScan::new(scans, span.clone()))
            },
            || self.metrics.record_retry(),
        )
    }
}

/// The revisions of consecutive range scans restricted to one key span.
pub struct SpanScan<'a> {
    scans: std::vec::IntoIter<RangeScan<'a>>,
    current: Option<RangeScan<'a>>,
    span: KeySpan,
}

impl<'a> SpanScan<'a> {
    fn new(scans: Vec<RangeScan<'a>>, span: KeySpan) -> Self {
        Self {
            scans: scans.into_iter(),
            current: None,
            span,
        }
    }
}

impl Iterator for SpanScan<'_> {
    type Item = Result<KeyRevision>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(scan) = self.current.as_mut() {
                match scan.next() {
                    Some(Ok(rev)) if !self.span.contains(&rev.key) => continue,
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            self.current = Some(self.scans.next()?);
        }
    }
}

/// Lazy, forward-only stream of one range's revisions in `[lo, hi)`.
pub struct RangeScan<'a> {
    inner: Option<RevisionIter>,
    lo: Timestamp,
    hi: Timestamp,
    metrics: &'a Metrics,
    cancel: Option<CancelToken>,
}

impl<'a> RangeScan<'a> {
    fn empty(metrics: &'a Metrics) -> Self {
        Self {
            inner: None,
            lo: Timestamp::ZERO,
            hi: Timestamp::ZERO,
            metrics,
            cancel: None,
        }
    }

    /// True if the range was skipped without being read.
    pub fn is_skipped(&self) -> bool {
        self.inner.is_none()
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<KeyRevision>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.as_ref().map_or(false, |c| c.is_cancelled()) && self.inner.is_some() {
                self.inner = None;
                return Some(Err(ArchivistError::Cancelled));
            }
            let rev = match self.inner.as_mut()?.next()? {
                Ok(rev) => rev,
                Err(err) => return Some(Err(err)),
            };
            self.metrics.record_revision_scanned(rev.size());
            if rev.timestamp >= self.lo && rev.timestamp < self.hi {
                return Some(Ok(rev));
            }
        }
    }
}
