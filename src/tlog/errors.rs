//! Transfer log error types

use thiserror::Error;

/// Result type for transfer log operations
pub type TlogResult<T> = Result<T, TlogError>;

/// Transfer log errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TlogError {
    /// A barrier acknowledgement named a barrier that is not the oldest
    /// outstanding epoch
    #[error("barrier ack for {acked} but oldest outstanding epoch is {oldest}")]
    BarrierMismatch {
        /// Barrier number of the oldest outstanding epoch
        oldest: u32,
        /// Barrier number the peer acknowledged
        acked: u32,
    },

    /// A barrier acknowledgement carried the wrong admission count
    #[error("barrier {barrier} acked with count {acked} but {recorded} writes were admitted")]
    CountMismatch {
        /// Barrier number being acknowledged
        barrier: u32,
        /// Admission count the log recorded
        recorded: u32,
        /// Count the peer reported
        acked: u32,
    },

    /// A completion event referenced a write the log does not know
    #[error("unknown write handle {handle}")]
    UnknownWrite {
        /// The stale or foreign handle
        handle: u64,
    },
}

impl TlogError {
    /// Barrier mismatches come from the peer and poison the connection.
    /// A stale handle is a local caller bug and does not.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, TlogError::UnknownWrite { .. })
    }
}
