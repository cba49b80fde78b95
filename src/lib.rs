//! ARCHIVIST - Backup, Restore & Bulk-Load Engine
//!
//! Point-in-time backups, minimal incremental backups and bulk loads for a
//! range-partitioned, timestamp-versioned key-value store.
//!
//! ## Features
//! - **Timestamp Oracle**: Hybrid logical clock tagging every write and snapshot
//! - **Time-Bound Scans**: Per-range timestamp summaries skip untouched ranges
//! - **Backups**: Full and incremental, published with an atomic manifest
//! - **Restores**: Chain validation, then idempotent per-range bulk file adds
//! - **Bulk Loads**: SQL-like statements to sorted DataFiles, restorable as a backup
//! - **Storage**: WAL-backed MVCC store with CRC32 integrity checks
//!
//! ## Example
//! ```no_run
//! use archivist::backup::{backup, BackupOptions};
//! use archivist::restore::{restore, RestoreOptions};
//! use archivist::{config::Config, engine::Store};
//!
//! let config = Config::new("./data");
//! let store = Store::open(config.clone()).unwrap();
//! store.put(b"key".to_vec(), b"value".to_vec()).unwrap();
//!
//! let full = backup(&store, &config, &BackupOptions::new("kv", "./backups/full")).unwrap();
//! println!("{} bytes backed up", full.total_size);
//!
//! let target_config = Config::new("./restored");
//! let target = Store::open(target_config.clone()).unwrap();
//! restore(&target, &target_config, &[full.manifest_path], &RestoreOptions::new()).unwrap();
//! assert_eq!(target.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod hlc;
pub mod load;
pub mod manifest;
pub mod pool;
pub mod restore;
pub mod retry;
pub mod scan;
pub mod types;
