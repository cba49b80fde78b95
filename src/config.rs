//! ARCHIVIST - Engine Configuration
//! Defines tunable parameters for the store, backups, restores and loads.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ArchivistError, Result};
use crate::retry::RetryPolicy;

/// Configuration for the Archivist engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all store files (WAL, ingested DataFiles).
    pub data_dir: PathBuf,

    /// Maximum size of the bulk-load sort buffer in bytes before a sorted
    /// run is spilled to the temporary directory.
    pub memtable_max_size: usize,

    /// Whether to sync WAL and DataFile writes to disk immediately (fsync).
    pub sync_writes: bool,

    /// Consult per-range timestamp summaries to skip ranges that cannot
    /// hold revisions in the scanned interval.
    pub time_bound_scans: bool,

    /// Number of per-range worker threads for backup, restore and load merge.
    pub worker_threads: usize,

    /// Backoff policy for transient per-range failures.
    pub retry: RetryPolicy,

    /// Largest tolerated gap between the physical clock and the oracle.
    /// Zero disables the check.
    pub max_clock_offset: Duration,

    /// Bulk-load output files roll over once they reach this size.
    pub target_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_max_size: 4 * 1024 * 1024, // 4 MB
            sync_writes: true,
            time_bound_scans: true,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            retry: RetryPolicy::default(),
            max_clock_offset: Duration::from_millis(500),
            target_file_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the maximum sort buffer size before a spill.
    pub fn with_memtable_max_size(mut self, size: usize) -> Self {
        self.memtable_max_size = size;
        self
    }

    /// Toggle time-bound range skipping.
    pub fn with_time_bound_scans(mut self, enabled: bool) -> Self {
        self.time_bound_scans = enabled;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_clock_offset(mut self, offset: Duration) -> Self {
        self.max_clock_offset = offset;
        self
    }

    pub fn with_target_file_size(mut self, size: u64) -> Self {
        self.target_file_size = size;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Reject settings that would stall or never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ArchivistError::Config("worker_threads must be > 0".into()));
        }
        if self.memtable_max_size == 0 {
            return Err(ArchivistError::Config(
                "memtable_max_size must be > 0".into(),
            ));
        }
        if self.target_file_size == 0 {
            return Err(ArchivistError::Config("target_file_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ArchivistError::Config(
                "retry.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.data_dir.join("files"))
    }
}
