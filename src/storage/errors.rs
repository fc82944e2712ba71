//! Storage backend error types

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by a [`super::BlockStorage`] backend
///
/// A storage error never tears down the connection by itself; it drives
/// the local disk state toward `Failed`, and the state machine decides
/// what happens next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// A sector range fell outside the device
    #[error("sector range {sector}+{count} out of bounds (capacity {capacity} sectors)")]
    OutOfBounds {
        /// First sector of the rejected range
        sector: u64,
        /// Number of sectors in the rejected range
        count: u64,
        /// Device capacity in sectors
        capacity: u64,
    },

    /// The backing device failed a read
    #[error("read failed at sector {sector}: {reason}")]
    ReadFailed {
        /// Sector where the failure occurred
        sector: u64,
        /// Backend-specific reason
        reason: String,
    },

    /// The backing device failed a write
    #[error("write failed at sector {sector}: {reason}")]
    WriteFailed {
        /// Sector where the failure occurred
        sector: u64,
        /// Backend-specific reason
        reason: String,
    },

    /// The backing device failed a durable flush
    #[error("flush failed: {0}")]
    FlushFailed(String),
}

impl StorageError {
    /// True if the error means the backing device itself is gone, as
    /// opposed to a caller mistake.
    pub fn is_device_failure(&self) -> bool {
        !matches!(self, StorageError::OutOfBounds { .. })
    }
}
