//! Invariants of the replica state machine: sanitize is a fixpoint,
//! rejected proposals never mutate, and cluster-wide changes commit
//! only with the peer's consent.

use blockmirror::state::{
    sanitize, ConnectionState, DiskState, Policy, RejectionReason, ReplicaState, Role,
    StateChange, StateMachine, STATE_CHANGE_OK,
};

fn connected() -> ReplicaState {
    let mut s = ReplicaState::initial();
    s.peer_role = Role::Secondary;
    s.connection = ConnectionState::Connected;
    s.disk = DiskState::UpToDate;
    s.peer_disk = DiskState::UpToDate;
    s
}

fn connected_machine() -> StateMachine {
    let mut sm = StateMachine::new(Policy::default());
    sm.force(
        StateChange::new()
            .connection(ConnectionState::Connected)
            .disk(DiskState::UpToDate)
            .peer_disk(DiskState::UpToDate)
            .peer_role(Role::Secondary),
    );
    sm
}

#[test]
fn test_sanitize_is_idempotent_across_state_space() {
    // a representative sweep rather than the full product space
    let connections = [
        ConnectionState::StandAlone,
        ConnectionState::Unconnected,
        ConnectionState::BrokenPipe,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::SyncSource,
        ConnectionState::SyncTarget,
        ConnectionState::PausedSyncTarget,
    ];
    let disks = [
        DiskState::Diskless,
        DiskState::Failed,
        DiskState::Inconsistent,
        DiskState::Outdated,
        DiskState::Consistent,
        DiskState::UpToDate,
    ];
    for os_conn in connections {
        for ns_conn in connections {
            for disk in disks {
                for peer_disk in disks {
                    let mut os = connected();
                    os.connection = os_conn;
                    let mut ns = os;
                    ns.connection = ns_conn;
                    ns.disk = disk;
                    ns.peer_disk = peer_disk;

                    let once = sanitize(os, ns);
                    let twice = sanitize(os, once.state);
                    assert_eq!(
                        once.state, twice.state,
                        "sanitize must be a fixpoint for {os_conn:?}->{ns_conn:?} \
                         disk {disk:?} peer {peer_disk:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_rejected_proposal_is_stable_under_repetition() {
    let mut sm = connected_machine();
    sm.force(StateChange::new().peer_role(Role::Primary));
    let before = sm.state();

    let change = StateChange::new().role(Role::Primary);
    for _ in 0..3 {
        let err = sm.propose(change).unwrap_err();
        assert_eq!(err, RejectionReason::TwoPrimariesNotAllowed);
        assert_eq!(sm.state(), before, "repetition must not leak mutation");
    }

    // an intervening legal change lifts the rejection
    sm.force(StateChange::new().peer_role(Role::Secondary));
    assert!(sm.propose(change).is_ok());
}

#[test]
fn test_network_error_family_unreachable_from_standalone() {
    let mut sm = StateMachine::new(Policy::default());
    let t = sm.force(StateChange::new().connection(ConnectionState::BrokenPipe));
    assert_eq!(
        t.new.connection,
        ConnectionState::StandAlone,
        "a link that never existed cannot fail"
    );
}

#[test]
fn test_connection_loss_erases_peer_knowledge() {
    let mut sm = connected_machine();
    sm.force(StateChange::new().peer_role(Role::Primary));
    let t = sm.force(StateChange::new().connection(ConnectionState::NetworkFailure));
    assert_eq!(t.new.peer_role, Role::Unknown);
    assert_eq!(t.new.peer_disk, DiskState::Unknown);
}

#[test]
fn test_cluster_wide_change_needs_peer_consent() {
    let mut sm = connected_machine();
    let change = StateChange::new().role(Role::Primary);
    assert!(sm.is_cluster_wide(change));

    sm.stage_cluster_change(change, 500).unwrap();
    assert_eq!(sm.state().role, Role::Secondary, "staged, not committed");

    let t = sm.resolve_cluster_change(STATE_CHANGE_OK).unwrap();
    assert_eq!(t.new.role, Role::Primary);
}

#[test]
fn test_cluster_wide_timeout_resolves_to_rejection() {
    let mut sm = connected_machine();
    sm.stage_cluster_change(StateChange::new().role(Role::Primary), 500)
        .unwrap();
    assert_eq!(sm.poll_cluster_timeout(499), None);
    assert_eq!(
        sm.poll_cluster_timeout(500),
        Some(RejectionReason::Timeout)
    );
    assert!(RejectionReason::Timeout.is_transient());
    assert_eq!(sm.state().role, Role::Secondary);
}

#[test]
fn test_rejection_codes_roundtrip_the_wire() {
    let reasons = [
        RejectionReason::TwoPrimariesNotAllowed,
        RejectionReason::NoUpToDateDisk,
        RejectionReason::ConnectedOutdates,
        RejectionReason::InTransientState,
        RejectionReason::NothingToDo,
        RejectionReason::Timeout,
    ];
    for reason in reasons {
        let code = reason.code();
        assert!(code < 0 || code != STATE_CHANGE_OK);
        assert_eq!(RejectionReason::from_code(code), Some(reason));
    }
}

#[test]
fn test_wire_state_packing_is_lossless() {
    let mut state = connected();
    state.role = Role::Primary;
    state.connection = ConnectionState::PausedSyncSource;
    state.user_paused = true;
    state.suspended = true;
    assert_eq!(ReplicaState::from_wire(state.to_wire()), Some(state));

    // garbage in the connection field must not produce a state
    assert_eq!(ReplicaState::from_wire(0x1f << 4), None);
}
