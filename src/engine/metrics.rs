//! ARCHIVIST - Operation Metrics & Observability
//! Atomic counters shared by the per-range workers of one operation
//! (and by the store's own write path) in a lock-free, thread-safe manner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for stores, scans, backups, restores and loads.
///
/// All counters use `Ordering::Relaxed` since we only need
/// eventual consistency for observability, not synchronization.
#[derive(Debug)]
pub struct Metrics {
    /// Revisions written through the ordinary write path.
    pub puts: AtomicU64,
    /// Tombstones written through the ordinary write path.
    pub deletes: AtomicU64,
    /// Point reads served.
    pub gets: AtomicU64,
    /// Ranges whose data was actually read.
    pub ranges_scanned: AtomicU64,
    /// Ranges skipped by their timestamp summary (zero bytes read).
    pub ranges_skipped: AtomicU64,
    /// Revisions visited while scanning (inside or outside the window).
    pub revisions_scanned: AtomicU64,
    /// Logical bytes visited while scanning.
    pub bytes_scanned: AtomicU64,
    /// DataFiles produced.
    pub files_written: AtomicU64,
    /// Bytes of DataFiles produced.
    pub bytes_written: AtomicU64,
    /// DataFiles attached to ranges.
    pub files_ingested: AtomicU64,
    /// Ingest requests for files a range already had.
    pub ingest_noops: AtomicU64,
    /// Retries scheduled after transient failures.
    pub retries: AtomicU64,
    started: Instant,
}

/// Plain copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub ranges_scanned: u64,
    pub ranges_skipped: u64,
    pub revisions_scanned: u64,
    pub bytes_scanned: u64,
    pub files_written: u64,
    pub bytes_written: u64,
    pub files_ingested: u64,
    pub ingest_noops: u64,
    pub retries: u64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            ranges_scanned: AtomicU64::new(0),
            ranges_skipped: AtomicU64::new(0),
            revisions_scanned: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            files_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            files_ingested: AtomicU64::new(0),
            ingest_noops: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_scanned(&self) {
        self.ranges_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_skipped(&self) {
        self.ranges_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one revision visited by a scan.
    pub fn record_revision_scanned(&self, size: usize) {
        self.revisions_scanned.fetch_add(1, Ordering::Relaxed);
        self.bytes_scanned.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_file_written(&self, size: u64) {
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_ingest(&self, added: usize, skipped: usize) {
        self.files_ingested.fetch_add(added as u64, Ordering::Relaxed);
        self.ingest_noops.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since these metrics were created.
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            ranges_scanned: self.ranges_scanned.load(Ordering::Relaxed),
            ranges_skipped: self.ranges_skipped.load(Ordering::Relaxed),
            revisions_scanned: self.revisions_scanned.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_ingested: self.files_ingested.load(Ordering::Relaxed),
            ingest_noops: self.ingest_noops.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        let s = self.snapshot();
        format!(
            "\n═══ ARCHIVIST Metrics ═══\n\
             Writes:\n\
               puts:      {}\n\
               deletes:   {}\n\
               gets:      {}\n\
             Scans:\n\
               ranges scanned: {}\n\
               ranges skipped: {}\n\
               revisions:      {}\n\
               bytes:          {}\n\
             Files:\n\
               written:   {} ({} bytes)\n\
               ingested:  {}\n\
               no-ops:    {}\n\
             Retries: {}\n\
             Elapsed: {:.2}s",
            s.puts,
            s.deletes,
            s.gets,
            s.ranges_scanned,
            s.ranges_skipped,
            s.revisions_scanned,
            s.bytes_scanned,
            s.files_written,
            s.bytes_written,
            s.files_ingested,
            s.ingest_noops,
            s.retries,
            self.elapsed_secs(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = Metrics::new();

        m.record_put();
        m.record_put();
        m.record_delete();
        m.record_range_scanned();
        m.record_range_skipped();
        m.record_revision_scanned(10);
        m.record_revision_scanned(15);
        m.record_file_written(100);
        m.record_ingest(2, 1);
        m.record_retry();

        let s = m.snapshot();
        assert_eq!(s.puts, 2);
        assert_eq!(s.deletes, 1);
        assert_eq!(s.ranges_scanned, 1);
        assert_eq!(s.ranges_skipped, 1);
        assert_eq!(s.revisions_scanned, 2);
        assert_eq!(s.bytes_scanned, 25);
        assert_eq!(s.files_written, 1);
        assert_eq!(s.bytes_written, 100);
        assert_eq!(s.files_ingested, 2);
        assert_eq!(s.ingest_noops, 1);
        assert_eq!(s.retries, 1);
    }

    #[test]
    fn test_report_format() {
        let m = Metrics::new();
        m.record_range_skipped();
        let report = m.report();
        assert!(report.contains("ranges skipped: 1"));
        assert!(report.contains("Retries:"));
    }

    #[test]
    fn test_default() {
        assert_eq!(Metrics::default().snapshot(), MetricsSnapshot::default());
    }
}
