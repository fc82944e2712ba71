//! Observability events for blockmirror
//!
//! Every externally visible action of the engine maps to exactly one
//! event. Events are explicit and typed; free-form log lines are not
//! permitted in the core.

use std::fmt;

/// Observable events in blockmirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Device lifecycle
    /// Device registered with the process-wide registry
    DeviceRegistered,
    /// Device removed from the registry
    DeviceRemoved,
    /// On-disk metadata superblock written
    MetaSync,
    /// On-disk metadata superblock rejected
    MetaInvalid,

    // Replica state machine
    /// State transition committed
    StateChange,
    /// State proposal rejected
    StateRejected,
    /// State transition forced (outside-world event)
    StateForced,
    /// Cluster-wide state change staged, waiting for the peer
    ClusterChangeStaged,
    /// Cluster-wide state change resolved (committed or refused)
    ClusterChangeResolved,

    // Transfer log
    /// Barrier opened, epoch closed for admissions
    BarrierOpened,
    /// Barrier acknowledged, epoch retired
    BarrierReleased,
    /// Barrier acknowledgement did not match the oldest epoch
    BarrierMismatch,
    /// Transfer log cleared after connection loss
    TransferLogCleared,

    // Connection
    /// Connection to the peer established
    PeerConnected,
    /// Connection to the peer lost
    PeerLost,
    /// Fatal protocol violation on the connection
    ProtocolViolation,

    // Resynchronization
    /// Resync decision computed from the UUID chains
    ResyncDecision,
    /// Resync started
    ResyncStart,
    /// Resync progressed (periodic)
    ResyncProgress,
    /// Resync paused or resumed
    ResyncPauseToggle,
    /// Resync finished, bitmap weight is zero
    ResyncComplete,
    /// Resync aborted by a disk failure
    ResyncAborted,
    /// Loaded metadata demands a full sync before the device is trusted
    FullSyncPending,

    // UUID management
    /// New current-generation UUID created
    UuidNewCurrent,
    /// UUID set rotated after resync completion
    UuidRotated,
}

impl Event {
    /// Stable event name used as the `event` field of the log line
    pub fn name(&self) -> &'static str {
        match self {
            Event::DeviceRegistered => "DEVICE_REGISTERED",
            Event::DeviceRemoved => "DEVICE_REMOVED",
            Event::MetaSync => "META_SYNC",
            Event::MetaInvalid => "META_INVALID",
            Event::StateChange => "STATE_CHANGE",
            Event::StateRejected => "STATE_REJECTED",
            Event::StateForced => "STATE_FORCED",
            Event::ClusterChangeStaged => "CLUSTER_CHANGE_STAGED",
            Event::ClusterChangeResolved => "CLUSTER_CHANGE_RESOLVED",
            Event::BarrierOpened => "BARRIER_OPENED",
            Event::BarrierReleased => "BARRIER_RELEASED",
            Event::BarrierMismatch => "BARRIER_MISMATCH",
            Event::TransferLogCleared => "TRANSFER_LOG_CLEARED",
            Event::PeerConnected => "PEER_CONNECTED",
            Event::PeerLost => "PEER_LOST",
            Event::ProtocolViolation => "PROTOCOL_VIOLATION",
            Event::ResyncDecision => "RESYNC_DECISION",
            Event::ResyncStart => "RESYNC_START",
            Event::ResyncProgress => "RESYNC_PROGRESS",
            Event::ResyncPauseToggle => "RESYNC_PAUSE_TOGGLE",
            Event::ResyncComplete => "RESYNC_COMPLETE",
            Event::ResyncAborted => "RESYNC_ABORTED",
            Event::FullSyncPending => "FULL_SYNC_PENDING",
            Event::UuidNewCurrent => "UUID_NEW_CURRENT",
            Event::UuidRotated => "UUID_ROTATED",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
