//! Per-predicate wakeups
//!
//! Waiters subscribe to exactly the condition they care about and get
//! their own channel for it. A waiter on a barrier release can never be
//! woken by a state change and then have to re-check some shared
//! predicate.

use crate::resync::ResyncProgress;
use crate::state::ReplicaState;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Fan-out of device conditions to subscribed waiters.
///
/// Senders whose receiver has been dropped are pruned on the next
/// notification.
#[derive(Default)]
pub struct Notifier {
    state_changed: Vec<Sender<ReplicaState>>,
    barrier_released: Vec<Sender<u32>>,
    resync_progress: Vec<Sender<ResyncProgress>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed state transition, with the new state.
    pub fn subscribe_state_changed(&mut self) -> Receiver<ReplicaState> {
        let (tx, rx) = channel();
        self.state_changed.push(tx);
        rx
    }

    /// Every successful barrier release, with the barrier number.
    pub fn subscribe_barrier_released(&mut self) -> Receiver<u32> {
        let (tx, rx) = channel();
        self.barrier_released.push(tx);
        rx
    }

    /// Every resync progress step.
    pub fn subscribe_resync_progress(&mut self) -> Receiver<ResyncProgress> {
        let (tx, rx) = channel();
        self.resync_progress.push(tx);
        rx
    }

    pub fn notify_state_changed(&mut self, state: ReplicaState) {
        self.state_changed.retain(|tx| tx.send(state).is_ok());
    }

    pub fn notify_barrier_released(&mut self, barrier_number: u32) {
        self.barrier_released
            .retain(|tx| tx.send(barrier_number).is_ok());
    }

    pub fn notify_resync_progress(&mut self, progress: ResyncProgress) {
        self.resync_progress.retain(|tx| tx.send(progress).is_ok());
    }
}
