//! Stable rejection codes for state proposals
//!
//! Every rejected proposal maps to one of these codes, never a
//! free-form string, so callers can tell retryable outcomes from
//! permanent ones and so the code survives the wire in a state-change
//! reply.

use thiserror::Error;

/// Result type for state transitions
pub type StateResult<T> = Result<T, RejectionReason>;

/// Wire code carried in a successful state-change reply.
pub const STATE_CHANGE_OK: i32 = 1;

/// Why a proposed state was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("refusing two primaries without dual-primary configuration")]
    TwoPrimariesNotAllowed,
    #[error("no up-to-date disk available anywhere")]
    NoUpToDateDisk,
    #[error("local disk too inconsistent for a sync state")]
    NoLocalDisk,
    #[error("peer disk too inconsistent for a sync state")]
    NoRemoteDisk,
    #[error("refusing to serve an outdated disk to a connected peer")]
    ConnectedOutdates,
    #[error("online verify requested but no verify algorithm configured")]
    NoVerifyAlgorithm,
    #[error("a resynchronization is already running")]
    ResyncAlreadyRunning,
    #[error("already standalone")]
    AlreadyStandAlone,
    #[error("device has no attached disk")]
    IsDiskless,
    #[error("no network configuration for this device")]
    NoNetworkConfig,
    #[error("refusing to outdate a disk that is below outdated")]
    LowerThanOutdated,
    #[error("device is in a transient state, retry")]
    InTransientState,
    #[error("requested connection-level operation needs an established connection")]
    NeedConnection,
    #[error("proposal changes nothing")]
    NothingToDo,
    #[error("peer refused the cluster-wide change")]
    FailedByPeer,
    #[error("cluster-wide change timed out waiting for the peer")]
    Timeout,
}

impl RejectionReason {
    /// Wire code for a state-change reply. Success is
    /// [`STATE_CHANGE_OK`]; every rejection is negative.
    pub fn code(self) -> i32 {
        match self {
            RejectionReason::TwoPrimariesNotAllowed => -1,
            RejectionReason::NoUpToDateDisk => -2,
            RejectionReason::NoLocalDisk => -3,
            RejectionReason::NoRemoteDisk => -4,
            RejectionReason::ConnectedOutdates => -5,
            RejectionReason::NoVerifyAlgorithm => -6,
            RejectionReason::ResyncAlreadyRunning => -7,
            RejectionReason::AlreadyStandAlone => -8,
            RejectionReason::IsDiskless => -9,
            RejectionReason::NoNetworkConfig => -10,
            RejectionReason::LowerThanOutdated => -11,
            RejectionReason::InTransientState => -12,
            RejectionReason::NeedConnection => -13,
            RejectionReason::NothingToDo => -14,
            RejectionReason::FailedByPeer => -15,
            RejectionReason::Timeout => -16,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i32) -> Option<RejectionReason> {
        Some(match code {
            -1 => RejectionReason::TwoPrimariesNotAllowed,
            -2 => RejectionReason::NoUpToDateDisk,
            -3 => RejectionReason::NoLocalDisk,
            -4 => RejectionReason::NoRemoteDisk,
            -5 => RejectionReason::ConnectedOutdates,
            -6 => RejectionReason::NoVerifyAlgorithm,
            -7 => RejectionReason::ResyncAlreadyRunning,
            -8 => RejectionReason::AlreadyStandAlone,
            -9 => RejectionReason::IsDiskless,
            -10 => RejectionReason::NoNetworkConfig,
            -11 => RejectionReason::LowerThanOutdated,
            -12 => RejectionReason::InTransientState,
            -13 => RejectionReason::NeedConnection,
            -14 => RejectionReason::NothingToDo,
            -15 => RejectionReason::FailedByPeer,
            -16 => RejectionReason::Timeout,
            _ => return None,
        })
    }

    /// True if the same proposal may succeed if simply retried later.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            RejectionReason::InTransientState
                | RejectionReason::Timeout
                | RejectionReason::NothingToDo
        )
    }
}
