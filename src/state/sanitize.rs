//! Derivation of implicit state consequences
//!
//! A proposed state rarely stands on its own: losing the connection
//! says something about the peer, a failing disk ends a resync, pause
//! flags move a sync between running and paused sub-states. Sanitize
//! resolves all of that before validation, so validation only ever
//! sees fully derived candidates.

use super::types::{ConnectionState, DiskState, ReplicaState, Role};

/// Sanitized candidate plus what deriving it implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitized {
    pub state: ReplicaState,
    /// A running resync was implicitly aborted back to `Connected`.
    pub resync_aborted: bool,
    /// The disk state was implicitly moved; worth a warning log.
    pub disk_adjusted: bool,
}

/// Resolve the implicit consequences of moving from `os` to `ns`.
///
/// Idempotent: sanitizing an already-sanitized state changes nothing.
pub fn sanitize(os: ReplicaState, mut ns: ReplicaState) -> Sanitized {
    use ConnectionState as C;
    use DiskState as D;

    let mut resync_aborted = false;
    let mut disk_adjusted = false;

    // a network error cannot appear out of nowhere on an unconfigured
    // connection
    if ns.connection.is_network_error() && os.connection <= C::Unconnected {
        ns.connection = os.connection;
    }

    // after a network error only Unconnected or Disconnecting may follow
    if os.connection.is_network_error()
        && ns.connection != C::Unconnected
        && ns.connection != C::Disconnecting
    {
        ns.connection = os.connection;
    }

    // after Disconnecting only StandAlone may follow
    if os.connection == C::Disconnecting && ns.connection != C::StandAlone {
        ns.connection = os.connection;
    }

    // connection loss: the peer and its disk are unknown to us now
    if ns.connection < C::Connected {
        ns.peer_paused = false;
        ns.peer_role = Role::Unknown;
        if ns.peer_disk > D::Unknown || ns.peer_disk < D::Inconsistent {
            ns.peer_disk = D::Unknown;
        }
    }

    // fully unconfigured: drop the dependency pause
    if ns.connection == C::StandAlone && ns.disk == D::Diskless && ns.role == Role::Secondary {
        ns.after_state_paused = false;
    }

    if ns.connection <= C::Disconnecting && ns.disk == D::Diskless {
        ns.peer_disk = D::Unknown;
    }

    // a disk dropping to Failed or worse on either side ends the resync
    if os.connection.is_sync_active()
        && ns.connection.is_sync_active()
        && (ns.disk <= D::Failed || ns.peer_disk <= D::Failed)
    {
        resync_aborted = true;
        ns.connection = C::Connected;
    }

    // connection broke down mid-negotiation: nothing was agreed about
    // our data, treat the device as having none
    if ns.connection < C::Connected && ns.disk == D::Negotiating {
        ns.disk = D::Diskless;
        ns.peer_disk = D::Unknown;
        disk_adjusted = true;
    }

    // resolve Consistent/Outdated local disk against the live link
    if ns.connection >= C::Connected
        && (ns.disk == D::Consistent
            || ns.disk == D::Outdated
            || (ns.disk == D::Negotiating && ns.connection == C::WaitBitmapTarget))
    {
        let resolved = match ns.connection {
            C::WaitBitmapTarget | C::PausedSyncTarget => Some(D::Outdated),
            C::Connected | C::WaitBitmapSource | C::SyncSource | C::PausedSyncSource => {
                Some(D::UpToDate)
            }
            C::SyncTarget => Some(D::Inconsistent),
            _ => None,
        };
        if let Some(disk) = resolved {
            if disk != ns.disk {
                disk_adjusted = true;
            }
            ns.disk = disk;
        }
    }

    // same resolution for the peer's disk, seen from our side of the link
    if ns.connection >= C::Connected
        && (ns.peer_disk == D::Consistent || ns.peer_disk == D::Outdated)
    {
        let resolved = match ns.connection {
            C::Connected | C::WaitBitmapTarget | C::PausedSyncTarget | C::SyncTarget => {
                Some(D::UpToDate)
            }
            C::WaitBitmapSource | C::PausedSyncSource => {
                // remap consistent to Outdated, but never upgrade a
                // disk that was not even consistent
                Some(if os.peer_disk > D::Diskless && os.peer_disk < D::Outdated {
                    os.peer_disk
                } else {
                    D::Outdated
                })
            }
            C::SyncSource => Some(D::Inconsistent),
            _ => None,
        };
        if let Some(disk) = resolved {
            if disk != ns.peer_disk {
                disk_adjusted = true;
            }
            ns.peer_disk = disk;
        }
    }

    // pause flags move a running sync into its paused twin and back
    if ns.any_pause() {
        if ns.connection == C::SyncSource {
            ns.connection = C::PausedSyncSource;
        }
        if ns.connection == C::SyncTarget {
            ns.connection = C::PausedSyncTarget;
        }
    } else {
        if ns.connection == C::PausedSyncSource {
            ns.connection = C::SyncSource;
        }
        if ns.connection == C::PausedSyncTarget {
            ns.connection = C::SyncTarget;
        }
    }

    Sanitized {
        state: ns,
        resync_aborted,
        disk_adjusted,
    }
}
