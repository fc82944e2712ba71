//! Deferred work queue
//!
//! Side effects of a state transition are queued as tagged values and
//! drained by one dispatch loop in the device, outside the moment the
//! transition itself is computed. No callbacks, no function pointers:
//! every kind of deferred work is a variant here.

use std::collections::VecDeque;

/// One unit of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredWork {
    /// Broadcast our state to the peer.
    NotifyPeer,
    /// Fail the transfer log after connection loss.
    ClearTransferLog,
    /// Re-derive and persist metadata flags.
    FlushMetadata,
    /// Begin a resynchronization in the given direction.
    StartResync { as_source: bool },
    /// Stop the running resynchronization.
    AbortResync,
    /// Open a new data generation (promotion without a reachable,
    /// up-to-date peer).
    NewCurrentUuid,
}

/// FIFO of deferred work, drained by the device's dispatch loop.
#[derive(Debug, Default)]
pub struct WorkQueue {
    jobs: VecDeque<DeferredWork>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: DeferredWork) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<DeferredWork> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
