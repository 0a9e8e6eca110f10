//! Storage error types

use thiserror::Error;

/// Storage operation errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Log file I/O failed
    #[error("IO error: {0}")]
    Io(String),

    /// Checksum mismatch in a framed record
    #[error("Corrupted record at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    CrcMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// Persisted data cannot be interpreted
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Malformed batch representation
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Merge operands could not be combined
    #[error("Merge error: {0}")]
    Merge(String),

    /// Record too large for the log
    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// Storage is closed
    #[error("Storage is closed")]
    Closed,
}

impl StorageError {
    /// True if the error means persisted bytes are damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CrcMismatch { .. } | StorageError::Corrupted(_)
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
