//! Standing invariants and transition legality

use super::errors::{RejectionReason, StateResult};
use super::types::{ConnectionState, DiskState, ReplicaState, Role};

/// Configuration the validator needs but the state itself does not carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    /// Permit Primary on both replicas at once.
    pub allow_two_primaries: bool,
    /// An online-verify digest algorithm is configured.
    pub verify_configured: bool,
}

/// Check standing invariants of a (sanitized) candidate state.
pub fn is_valid_state(ns: ReplicaState, policy: Policy) -> StateResult<()> {
    use ConnectionState as C;
    use DiskState as D;

    if !policy.allow_two_primaries && ns.role == Role::Primary && ns.peer_role == Role::Primary {
        return Err(RejectionReason::TwoPrimariesNotAllowed);
    }

    if ns.role == Role::Primary && ns.connection < C::Connected && ns.disk < D::UpToDate {
        return Err(RejectionReason::NoUpToDateDisk);
    }

    if ns.role == Role::Primary && ns.disk <= D::Inconsistent && ns.peer_disk <= D::Inconsistent {
        return Err(RejectionReason::NoUpToDateDisk);
    }

    if ns.connection.is_sync_active() && ns.disk < D::Inconsistent {
        return Err(RejectionReason::NoLocalDisk);
    }

    if ns.connection.is_sync_active() && ns.peer_disk < D::Inconsistent {
        return Err(RejectionReason::NoRemoteDisk);
    }

    if ns.connection.is_sync_active() && ns.disk < D::UpToDate && ns.peer_disk < D::UpToDate {
        return Err(RejectionReason::NoUpToDateDisk);
    }

    if matches!(
        ns.connection,
        C::Connected | C::WaitBitmapSource | C::SyncSource | C::PausedSyncSource
    ) && ns.disk == D::Outdated
    {
        return Err(RejectionReason::ConnectedOutdates);
    }

    if matches!(ns.connection, C::VerifySource | C::VerifyTarget) && !policy.verify_configured {
        return Err(RejectionReason::NoVerifyAlgorithm);
    }

    Ok(())
}

/// Check that `os -> ns` is a legal move at all, independent of
/// whether `ns` itself is valid.
pub fn is_valid_transition(os: ReplicaState, ns: ReplicaState) -> StateResult<()> {
    use ConnectionState as C;
    use DiskState as D;

    if matches!(
        ns.connection,
        C::StartingSyncSource | C::StartingSyncTarget
    ) && os.connection.is_sync_active()
    {
        return Err(RejectionReason::ResyncAlreadyRunning);
    }

    if ns.connection == C::Disconnecting && os.connection == C::StandAlone {
        return Err(RejectionReason::AlreadyStandAlone);
    }

    if ns.disk > D::Attaching && os.disk == D::Diskless {
        return Err(RejectionReason::IsDiskless);
    }

    if ns.connection == C::Connecting && os.connection < C::Unconnected {
        return Err(RejectionReason::NoNetworkConfig);
    }

    if ns.disk == D::Outdated && os.disk < D::Outdated && os.disk != D::Attaching {
        return Err(RejectionReason::LowerThanOutdated);
    }

    if ns.connection == C::Disconnecting && os.connection == C::Unconnected {
        return Err(RejectionReason::InTransientState);
    }

    if ns.connection == os.connection && ns.connection == C::Negotiating {
        return Err(RejectionReason::InTransientState);
    }

    if matches!(ns.connection, C::VerifySource | C::VerifyTarget) && os.connection < C::Connected {
        return Err(RejectionReason::NeedConnection);
    }

    if matches!(ns.connection, C::VerifySource | C::VerifyTarget)
        && ns.connection != os.connection
        && os.connection.is_sync_active()
    {
        return Err(RejectionReason::ResyncAlreadyRunning);
    }

    if matches!(
        ns.connection,
        C::StartingSyncSource | C::StartingSyncTarget
    ) && os.connection < C::Connected
    {
        return Err(RejectionReason::NeedConnection);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ReplicaState {
        ReplicaState {
            role: Role::Secondary,
            peer_role: Role::Secondary,
            connection: ConnectionState::Connected,
            disk: DiskState::UpToDate,
            peer_disk: DiskState::UpToDate,
            suspended: false,
            after_state_paused: false,
            peer_paused: false,
            user_paused: false,
        }
    }

    #[test]
    fn test_two_primaries_rejected_unless_configured() {
        let mut ns = base();
        ns.role = Role::Primary;
        ns.peer_role = Role::Primary;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::TwoPrimariesNotAllowed)
        );
        assert_eq!(
            is_valid_state(
                ns,
                Policy {
                    allow_two_primaries: true,
                    verify_configured: false
                }
            ),
            Ok(())
        );
    }

    #[test]
    fn test_primary_needs_a_usable_copy_somewhere() {
        let mut ns = base();
        ns.role = Role::Primary;
        ns.connection = ConnectionState::StandAlone;
        ns.peer_role = Role::Unknown;
        ns.peer_disk = DiskState::Unknown;
        ns.disk = DiskState::Inconsistent;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::NoUpToDateDisk)
        );

        ns.disk = DiskState::UpToDate;
        assert_eq!(is_valid_state(ns, Policy::default()), Ok(()));
    }

    #[test]
    fn test_sync_states_need_disks_on_both_sides() {
        let mut ns = base();
        ns.connection = ConnectionState::SyncSource;
        ns.peer_disk = DiskState::Inconsistent;
        assert_eq!(is_valid_state(ns, Policy::default()), Ok(()));

        ns.peer_disk = DiskState::Diskless;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::NoRemoteDisk)
        );

        ns.peer_disk = DiskState::UpToDate;
        ns.disk = DiskState::Failed;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::NoLocalDisk)
        );
    }

    #[test]
    fn test_connected_outdated_disk_rejected() {
        let mut ns = base();
        ns.disk = DiskState::Outdated;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::ConnectedOutdates)
        );
    }

    #[test]
    fn test_verify_needs_algorithm() {
        let mut ns = base();
        ns.connection = ConnectionState::VerifySource;
        assert_eq!(
            is_valid_state(ns, Policy::default()),
            Err(RejectionReason::NoVerifyAlgorithm)
        );
    }

    #[test]
    fn test_starting_sync_needs_connection() {
        let mut os = base();
        os.connection = ConnectionState::Unconnected;
        os.peer_role = Role::Unknown;
        let mut ns = os;
        ns.connection = ConnectionState::StartingSyncSource;
        assert_eq!(
            is_valid_transition(os, ns),
            Err(RejectionReason::NeedConnection)
        );
    }

    #[test]
    fn test_starting_sync_rejected_while_resync_runs() {
        let mut os = base();
        os.connection = ConnectionState::SyncTarget;
        os.disk = DiskState::Inconsistent;
        let mut ns = os;
        ns.connection = ConnectionState::StartingSyncTarget;
        assert_eq!(
            is_valid_transition(os, ns),
            Err(RejectionReason::ResyncAlreadyRunning)
        );
    }

    #[test]
    fn test_disconnect_from_standalone_rejected() {
        let mut os = base();
        os.connection = ConnectionState::StandAlone;
        let mut ns = os;
        ns.connection = ConnectionState::Disconnecting;
        assert_eq!(
            is_valid_transition(os, ns),
            Err(RejectionReason::AlreadyStandAlone)
        );
    }

    #[test]
    fn test_diskless_cannot_jump_past_attaching() {
        let mut os = base();
        os.disk = DiskState::Diskless;
        let mut ns = os;
        ns.disk = DiskState::UpToDate;
        assert_eq!(is_valid_transition(os, ns), Err(RejectionReason::IsDiskless));

        ns.disk = DiskState::Attaching;
        assert_eq!(is_valid_transition(os, ns), Ok(()));
    }

    #[test]
    fn test_outdating_requires_at_least_outdated() {
        let mut os = base();
        os.disk = DiskState::Inconsistent;
        os.connection = ConnectionState::StandAlone;
        os.peer_role = Role::Unknown;
        let mut ns = os;
        ns.disk = DiskState::Outdated;
        assert_eq!(
            is_valid_transition(os, ns),
            Err(RejectionReason::LowerThanOutdated)
        );
    }
}
