//! The replica state machine
//!
//! Owns the authoritative [`ReplicaState`] and pushes every mutation
//! through sanitize and the two validators. Side effects of a committed
//! transition are returned as values for the caller to run outside any
//! lock, never executed from in here.

use super::errors::{RejectionReason, StateResult, STATE_CHANGE_OK};
use super::sanitize::sanitize;
use super::types::{ConnectionState, DiskState, ReplicaState, Role, StateChange};
use super::validate::{is_valid_state, is_valid_transition, Policy};

/// Deferred consequence of a committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Broadcast the new state to the peer.
    NotifyPeer,
    /// The link is gone; fail the transfer log.
    ConnectionLost,
    /// A resynchronization began.
    ResyncStarted { as_source: bool },
    /// A running resynchronization was stopped.
    ResyncAborted,
    /// Persist metadata; role or disk knowledge changed.
    FlushMetadata,
    /// The local replica became Primary.
    Promoted,
    /// The local replica stopped being Primary.
    Demoted,
}

/// A committed transition and its deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub old: ReplicaState,
    pub new: ReplicaState,
    pub effects: Vec<SideEffect>,
    /// Sanitize moved a disk field; worth a warning log.
    pub disk_adjusted: bool,
}

/// A cluster-wide change staged while waiting for the peer's verdict.
#[derive(Debug, Clone, Copy)]
struct StagedChange {
    change: StateChange,
    deadline_millis: u64,
}

pub struct StateMachine {
    current: ReplicaState,
    policy: Policy,
    staged: Option<StagedChange>,
}

impl StateMachine {
    pub fn new(policy: Policy) -> Self {
        Self {
            current: ReplicaState::initial(),
            policy,
            staged: None,
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.current
    }

    /// True if applying `change` requires peer agreement before commit.
    pub fn is_cluster_wide(&self, change: StateChange) -> bool {
        use ConnectionState as C;
        let os = self.current;
        let ns = change.apply(os);
        (os.connection >= C::Connected
            && ns.connection >= C::Connected
            && ((os.role != Role::Primary && ns.role == Role::Primary)
                || (os.connection != C::StartingSyncTarget
                    && ns.connection == C::StartingSyncTarget)
                || (os.connection != C::StartingSyncSource
                    && ns.connection == C::StartingSyncSource)
                || (os.disk != DiskState::Diskless && ns.disk == DiskState::Diskless)))
            || (os.connection >= C::Connected && ns.connection == C::Disconnecting)
            || (os.connection == C::Connected && ns.connection == C::VerifySource)
    }

    /// Propose a local state change through the full rule set.
    pub fn propose(&mut self, change: StateChange) -> StateResult<Transition> {
        let os = self.current;
        let candidate = change.apply(os);
        let sanitized = sanitize(os, candidate);
        if sanitized.state == os {
            return Err(RejectionReason::NothingToDo);
        }
        is_valid_state(sanitized.state, self.policy)?;
        is_valid_transition(os, sanitized.state)?;
        Ok(self.commit(sanitized.state, sanitized.resync_aborted, sanitized.disk_adjusted))
    }

    /// Impose a change that already happened outside our control, such
    /// as a network error. Sanitize still runs; validation does not.
    pub fn force(&mut self, change: StateChange) -> Transition {
        let os = self.current;
        let sanitized = sanitize(os, change.apply(os));
        self.commit(sanitized.state, sanitized.resync_aborted, sanitized.disk_adjusted)
    }

    /// Stage a cluster-wide change and return the mask/value pair to
    /// send to the peer. The change is validated locally first so an
    /// obviously doomed request never crosses the wire.
    pub fn stage_cluster_change(
        &mut self,
        change: StateChange,
        deadline_millis: u64,
    ) -> StateResult<(u32, u32)> {
        if self.staged.is_some() {
            return Err(RejectionReason::InTransientState);
        }
        let os = self.current;
        let sanitized = sanitize(os, change.apply(os));
        if sanitized.state == os {
            return Err(RejectionReason::NothingToDo);
        }
        is_valid_state(sanitized.state, self.policy)?;
        is_valid_transition(os, sanitized.state)?;
        self.staged = Some(StagedChange {
            change,
            deadline_millis,
        });
        Ok(change.to_wire())
    }

    /// Resolve the staged change against the peer's reply code.
    pub fn resolve_cluster_change(&mut self, reply_code: i32) -> StateResult<Transition> {
        let staged = self.staged.take().ok_or(RejectionReason::InTransientState)?;
        if reply_code != STATE_CHANGE_OK {
            return Err(
                RejectionReason::from_code(reply_code).unwrap_or(RejectionReason::FailedByPeer)
            );
        }
        // the peer agreed; commit without re-judging validity, the
        // world may already have moved under us
        Ok(self.force(staged.change))
    }

    /// Expire the staged change once its deadline passes. Returns the
    /// rejection the original requester must see.
    pub fn poll_cluster_timeout(&mut self, now_millis: u64) -> Option<RejectionReason> {
        match self.staged {
            Some(staged) if now_millis >= staged.deadline_millis => {
                self.staged = None;
                Some(RejectionReason::Timeout)
            }
            _ => None,
        }
    }

    pub fn has_staged_change(&self) -> bool {
        self.staged.is_some()
    }

    /// Judge and apply a state change the peer requested. Returns the
    /// wire reply code and, on success, the committed transition.
    pub fn handle_peer_request(&mut self, change: StateChange) -> (i32, Option<Transition>) {
        match self.propose(change) {
            Ok(transition) => (STATE_CHANGE_OK, Some(transition)),
            Err(reason) => (reason.code(), None),
        }
    }

    fn commit(&mut self, new: ReplicaState, resync_aborted: bool, disk_adjusted: bool) -> Transition {
        use ConnectionState as C;
        let old = self.current;
        self.current = new;

        let mut effects = Vec::new();
        if new.connection >= C::Negotiating {
            effects.push(SideEffect::NotifyPeer);
        }
        if old.connection >= C::Connected && new.connection < C::Connected {
            effects.push(SideEffect::ConnectionLost);
        }
        if new.connection == C::SyncSource
            && old.connection != C::SyncSource
            && old.connection != C::PausedSyncSource
        {
            effects.push(SideEffect::ResyncStarted { as_source: true });
        }
        if new.connection == C::SyncTarget
            && old.connection != C::SyncTarget
            && old.connection != C::PausedSyncTarget
        {
            effects.push(SideEffect::ResyncStarted { as_source: false });
        }
        if resync_aborted
            || (old.connection.is_sync_active() && !new.connection.is_sync_active())
        {
            effects.push(SideEffect::ResyncAborted);
        }
        if old.role != new.role || old.disk != new.disk || old.peer_disk != new.peer_disk {
            effects.push(SideEffect::FlushMetadata);
        }
        if old.role != Role::Primary && new.role == Role::Primary {
            effects.push(SideEffect::Promoted);
        }
        if old.role == Role::Primary && new.role != Role::Primary {
            effects.push(SideEffect::Demoted);
        }

        Transition {
            old,
            new,
            effects,
            disk_adjusted,
        }
    }
}
