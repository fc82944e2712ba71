//! Metadata error types

use thiserror::Error;

/// Result type for metadata operations
pub type MetaResult<T> = Result<T, MetaError>;

/// On-disk metadata errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetaError {
    /// The record does not carry the expected magic constant
    #[error("bad metadata magic {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        /// Magic found in the record
        found: u32,
        /// Magic this build writes
        expected: u32,
    },

    /// The record is not a full 512-byte block
    #[error("metadata record of {len} bytes, expected {expected}")]
    WrongLength {
        /// Bytes supplied
        len: usize,
        /// Required record size
        expected: usize,
    },

    /// A stored offset or size disagrees with the locally expected
    /// geometry
    #[error("metadata geometry mismatch in {field}: stored {stored}, expected {expected}")]
    GeometryMismatch {
        /// Name of the disagreeing field
        field: &'static str,
        /// Value in the record
        stored: i64,
        /// Locally derived value
        expected: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_the_field() {
        let err = MetaError::GeometryMismatch {
            field: "bitmap_offset",
            stored: 9,
            expected: 8,
        };
        assert!(err.to_string().contains("bitmap_offset"));
    }
}
