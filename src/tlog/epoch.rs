//! Epochs and barrier number sequencing

use super::log::WriteHandle;

/// First barrier number a fresh log hands out.
pub const INITIAL_BARRIER_NUMBER: u32 = 4711;

/// Next barrier number after `prev`. Wraps, skipping 0 which is
/// reserved for "no barrier issued yet".
pub fn next_barrier_number(prev: u32) -> u32 {
    match prev.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

/// One epoch of the transfer log: the writes admitted between two
/// consecutive barriers.
#[derive(Debug, Clone)]
pub struct Epoch {
    barrier_number: u32,
    writes: Vec<WriteHandle>,
    n_req: u32,
}

impl Epoch {
    pub fn new(barrier_number: u32) -> Self {
        debug_assert_ne!(barrier_number, 0);
        Self {
            barrier_number,
            writes: Vec::new(),
            n_req: 0,
        }
    }

    pub fn barrier_number(&self) -> u32 {
        self.barrier_number
    }

    /// Writes admitted since this epoch opened.
    pub fn n_req(&self) -> u32 {
        self.n_req
    }

    pub fn admit(&mut self, handle: WriteHandle) {
        self.writes.push(handle);
        self.n_req += 1;
    }

    pub fn writes(&self) -> &[WriteHandle] {
        &self.writes
    }

    pub fn take_writes(&mut self) -> Vec<WriteHandle> {
        std::mem::take(&mut self.writes)
    }
}
