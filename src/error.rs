//! ARCHIVIST - Custom Error Types
//! Defines the error hierarchy for backup, restore and bulk load.

use std::io::ErrorKind;

use thiserror::Error;

use crate::types::RangeId;

/// Custom Result type for the Archivist engine.
pub type Result<T> = std::result::Result<T, ArchivistError>;

/// Error types for the Archivist engine.
#[derive(Error, Debug)]
pub enum ArchivistError {
    /// I/O errors from file operations (WAL, DataFiles, manifests).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, unsorted file, bad header).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Key not found in the storage engine.
    #[error("Key not found")]
    KeyNotFound,

    /// WAL recovery failure.
    #[error("WAL recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed statement or schema mismatch during a bulk load.
    /// `statement` is the 1-based index of the offending statement when known.
    #[error("invalid input{}: {message}", statement_suffix(.statement))]
    Input {
        statement: Option<usize>,
        message: String,
    },

    /// A range could not be read or written right now; safe to retry.
    #[error("range {range} temporarily unavailable: {message}")]
    TransientIo { range: RangeId, message: String },

    /// Manifest chain discontinuity or key coverage gap/overlap.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// The physical clock lags the oracle (or a remote peer) by more than allowed.
    #[error("clock skew of {offset_nanos}ns exceeds maximum offset {max_offset_nanos}ns")]
    ClockSkew {
        offset_nanos: i64,
        max_offset_nanos: i64,
    },

    /// A range failed terminally and aborted the whole operation.
    #[error("{operation} failed on range {range}: {source}")]
    OperationFailed {
        operation: &'static str,
        range: RangeId,
        #[source]
        source: Box<ArchivistError>,
    },

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker panicked while holding an internal lock.
    #[error("internal lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl ArchivistError {
    /// Returns true if the failure may clear up on its own and the
    /// operation is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchivistError::TransientIo { .. } => true,
            ArchivistError::Io(err) => matches!(
                err.kind(),
                ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Wrap a terminal per-range failure.
    pub fn operation_failed(operation: &'static str, range: RangeId, source: ArchivistError) -> Self {
        match source {
            // Already attributed; do not nest.
            err @ ArchivistError::OperationFailed { .. } => err,
            err @ ArchivistError::Cancelled => err,
            other => ArchivistError::OperationFailed {
                operation,
                range,
                source: Box::new(other),
            },
        }
    }
}

fn statement_suffix(statement: &Option<usize>) -> String {
    statement
        .map(|n| format!(" in statement {}", n))
        .unwrap_or_default()
}

impl From<bincode::Error> for ArchivistError {
    fn from(err: bincode::Error) -> Self {
        ArchivistError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ArchivistError {
    fn from(err: serde_json::Error) -> Self {
        ArchivistError::Serialization(err.to_string())
    }
}
