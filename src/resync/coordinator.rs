//! Driving a resynchronization once a decision is made
//!
//! The coordinator is a step machine, not a thread: the device layer
//! asks it for the next chunk of work when the link has capacity, and
//! feeds completions back. Pausing is a flag check between steps, so
//! foreground I/O can always get ahead of resync traffic.

use super::decide::SyncDirection;
use super::errors::{ResyncError, ResyncResult};
use crate::bitmap::{BitmapResult, BitmapStore};

/// Where the resync stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPhase {
    Idle,
    Running,
    Paused,
    Done,
    Aborted,
}

/// Progress snapshot for operators and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncProgress {
    /// Dirty blocks still to move.
    pub remaining: u64,
    /// Dirty blocks when the resync started.
    pub total: u64,
}

/// One chunk of resync work: a dirty run to read and ship (source) or
/// to expect from the peer (target).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncChunk {
    pub block: u64,
    pub count: u64,
}

pub struct ResyncCoordinator {
    phase: ResyncPhase,
    direction: SyncDirection,
    cursor: u64,
    total: u64,
}

impl ResyncCoordinator {
    pub fn new() -> Self {
        Self {
            phase: ResyncPhase::Idle,
            direction: SyncDirection::Source,
            cursor: 0,
            total: 0,
        }
    }

    pub fn phase(&self) -> ResyncPhase {
        self.phase
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    /// Begin a resync over the bitmap's current dirty set.
    pub fn start(&mut self, direction: SyncDirection, bitmap: &BitmapStore) -> ResyncResult<()> {
        if matches!(self.phase, ResyncPhase::Running | ResyncPhase::Paused) {
            return Err(ResyncError::AlreadyRunning);
        }
        self.phase = if bitmap.weight() == 0 {
            ResyncPhase::Done
        } else {
            ResyncPhase::Running
        };
        self.direction = direction;
        self.cursor = 0;
        self.total = bitmap.weight();
        Ok(())
    }

    /// Next dirty run to transfer, at most `max_blocks` long. `None`
    /// while paused or when the walk has passed the last dirty bit;
    /// completion is decided by the bitmap weight, not the cursor,
    /// because foreground writes may re-dirty blocks behind it.
    pub fn next_chunk(&mut self, bitmap: &BitmapStore, max_blocks: u64) -> Option<ResyncChunk> {
        if self.phase != ResyncPhase::Running {
            return None;
        }
        let block = match bitmap.first_dirty_at_or_after(self.cursor) {
            Some(block) => block,
            None => {
                // wrap once for blocks re-dirtied behind the cursor
                self.cursor = 0;
                bitmap.first_dirty_at_or_after(0)?
            }
        };
        let count = bitmap.run_length_at(block).min(max_blocks.max(1));
        self.cursor = block + count;
        Some(ResyncChunk { block, count })
    }

    /// A chunk has been durably applied on the target side (source:
    /// the peer acknowledged; target: the local write finished). Clears
    /// the bits and retires the resync when nothing is left.
    pub fn record_synced(
        &mut self,
        bitmap: &mut BitmapStore,
        block: u64,
        count: u64,
    ) -> BitmapResult<ResyncPhase> {
        bitmap.clear(block..block + count)?;
        if matches!(self.phase, ResyncPhase::Running | ResyncPhase::Paused)
            && bitmap.weight() == 0
        {
            self.phase = ResyncPhase::Done;
        }
        Ok(self.phase)
    }

    /// Foreground writes while a resync runs re-dirty their blocks; the
    /// wrap in [`next_chunk`](Self::next_chunk) picks them up.
    pub fn pause(&mut self) -> ResyncResult<()> {
        match self.phase {
            ResyncPhase::Running => {
                self.phase = ResyncPhase::Paused;
                Ok(())
            }
            ResyncPhase::Paused => Ok(()),
            _ => Err(ResyncError::NotRunning),
        }
    }

    pub fn resume(&mut self) -> ResyncResult<()> {
        match self.phase {
            ResyncPhase::Paused => {
                self.phase = ResyncPhase::Running;
                Ok(())
            }
            ResyncPhase::Running => Ok(()),
            _ => Err(ResyncError::NotRunning),
        }
    }

    /// Stop the resync; the bitmap keeps its remaining dirty bits so a
    /// later reconnect can finish the job after a fresh decision.
    pub fn abort(&mut self) {
        if matches!(self.phase, ResyncPhase::Running | ResyncPhase::Paused) {
            self.phase = ResyncPhase::Aborted;
        }
    }

    pub fn progress(&self, bitmap: &BitmapStore) -> ResyncProgress {
        ResyncProgress {
            remaining: bitmap.weight(),
            total: self.total,
        }
    }
}

impl Default for ResyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
