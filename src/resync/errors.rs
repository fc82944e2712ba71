//! Resync coordinator error types

use thiserror::Error;

/// Result type for resync operations
pub type ResyncResult<T> = Result<T, ResyncError>;

/// Resync coordinator errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResyncError {
    /// An operation arrived while no resync was running
    #[error("no resynchronization is running")]
    NotRunning,

    /// A start request arrived while a resync was already running
    #[error("a resynchronization is already running")]
    AlreadyRunning,

    /// The two replicas carry unrelated data generations; refusing to
    /// overwrite either side automatically
    #[error("unrelated data generations, refusing automatic resynchronization")]
    UnrelatedData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert!(ResyncError::UnrelatedData.to_string().contains("unrelated"));
    }
}
