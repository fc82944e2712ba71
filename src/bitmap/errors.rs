//! Bitmap error types
//!
//! Range errors are caller mistakes and recoverable. Decode errors mean
//! the peer produced a malformed chunk; they are fatal to the
//! connection, same as any other protocol violation.

use thiserror::Error;

/// Result type for bitmap operations
pub type BitmapResult<T> = Result<T, BitmapError>;

/// Bitmap store and codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BitmapError {
    /// A block range fell outside the bitmap
    #[error("block range {block}+{count} out of bounds ({blocks} blocks total)")]
    OutOfBounds {
        /// First block of the rejected range
        block: u64,
        /// Number of blocks in the rejected range
        count: u64,
        /// Bitmap size in blocks
        blocks: u64,
    },

    /// A zero run length appeared past the start of the bitmap.
    ///
    /// A zero run is only legal as the very first run of the stream,
    /// where it exists to let the starts-with-set-bit flag carry the
    /// first bit value. Anywhere else it is producer corruption.
    #[error("zero run length at run index {run_index}, bitmap position {position}")]
    ZeroRunLength {
        /// Index of the offending run within the chunk
        run_index: usize,
        /// Bitmap position the decoder had reached
        position: u64,
    },

    /// Chunk exceeds the negotiated maximum size
    #[error("encoded chunk of {len} bytes exceeds maximum {max}")]
    ChunkTooLarge {
        /// Received chunk length
        len: usize,
        /// Negotiated maximum
        max: usize,
    },

    /// Chunk ended in the middle of a variable-length integer
    #[error("truncated variable-length integer in bitmap chunk")]
    TruncatedChunk,

    /// Runs decode past the end of the bitmap
    #[error("chunk overruns bitmap: position {position} of {blocks} blocks")]
    Overrun {
        /// Position the decoder would have to reach
        position: u64,
        /// Bitmap size in blocks
        blocks: u64,
    },
}

impl BitmapError {
    /// Decode errors are fatal to the connection; range errors are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BitmapError::OutOfBounds { .. })
    }
}
