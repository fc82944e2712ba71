//! Device-level error type
//!
//! Wraps the component errors so the embedding layer handles one type.

use super::config::ConfigError;
use crate::bitmap::BitmapError;
use crate::meta::MetaError;
use crate::proto::ProtoError;
use crate::resync::ResyncError;
use crate::state::RejectionReason;
use crate::storage::StorageError;
use crate::tlog::TlogError;
use thiserror::Error;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    #[error(transparent)]
    TransferLog(#[from] TlogError),

    #[error(transparent)]
    Protocol(#[from] ProtoError),

    #[error(transparent)]
    Metadata(#[from] MetaError),

    #[error(transparent)]
    Resync(#[from] ResyncError),

    #[error("state change rejected: {0}")]
    Rejected(#[from] RejectionReason),

    #[error("device is not primary, refusing application write")]
    NotPrimary,

    #[error("i/o is suspended")]
    Suspended,

    #[error("write of {sectors} sectors at {sector} exceeds agreed size {agreed}")]
    BeyondAgreedSize {
        sector: u64,
        sectors: u64,
        agreed: u64,
    },
}

impl DeviceError {
    /// True if the error poisons the connection rather than just
    /// failing the one operation it was returned from.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            DeviceError::TransferLog(e) => e.is_protocol_violation(),
            DeviceError::Protocol(e) => e.is_protocol_violation(),
            _ => false,
        }
    }
}
