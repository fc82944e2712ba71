//! The transfer log proper
//!
//! An ordered deque of epochs plus an arena of in-flight writes
//! addressed by stable handles. The log never holds zero epochs: the
//! back of the deque is always open for admissions, and releasing the
//! last epoch replaces it in the same call.

use super::epoch::{next_barrier_number, Epoch, INITIAL_BARRIER_NUMBER};
use super::errors::{TlogError, TlogResult};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Stable handle into the transfer log's write arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub u64);

/// Where an in-flight write stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Waiting on the local disk only
    LocalPending,
    /// Waiting on the peer only
    RemotePending,
    /// Waiting on both sides
    BothPending,
    /// Both completions observed
    Completed,
    /// The connection died while the write was in flight
    LostOnDisconnect,
}

/// One in-flight replicated write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub sector: u64,
    pub length: u32,
    /// Opaque id the submitter correlates completions with.
    pub correlation_id: u64,
    pub disposition: Disposition,
    /// Barrier number of the epoch the write was admitted under.
    pub barrier_number: u32,
}

/// A write surfaced to the submitter's failure path by
/// [`TransferLog::clear_on_disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostWrite {
    pub sector: u64,
    pub length: u32,
    pub correlation_id: u64,
}

/// Summary of a successful barrier release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub barrier_number: u32,
    /// Writes retired by the barrier ack.
    pub retired: u32,
    /// Correlation ids of writes now fully completed.
    pub completed: Vec<u64>,
    /// Writes still waiting on local disk completion.
    pub still_local: u32,
}

pub struct TransferLog {
    epochs: VecDeque<Epoch>,
    writes: HashMap<u64, PendingWrite>,
    /// Sector start -> handles, for overlap queries.
    by_sector: BTreeMap<u64, Vec<WriteHandle>>,
    /// Writes whose epoch was retired while their local disk I/O was
    /// still outstanding.
    unsequenced: Vec<WriteHandle>,
    next_handle: u64,
}

impl TransferLog {
    pub fn new() -> Self {
        let mut epochs = VecDeque::new();
        epochs.push_back(Epoch::new(INITIAL_BARRIER_NUMBER));
        Self {
            epochs,
            writes: HashMap::new(),
            by_sector: BTreeMap::new(),
            unsequenced: Vec::new(),
            next_handle: 1,
        }
    }

    /// Barrier number of the epoch currently open for admissions.
    pub fn current_barrier_number(&self) -> u32 {
        // the deque is never empty
        self.epochs.back().map(Epoch::barrier_number).unwrap_or(0)
    }

    /// Barrier number of the oldest outstanding epoch.
    pub fn oldest_barrier_number(&self) -> u32 {
        self.epochs.front().map(Epoch::barrier_number).unwrap_or(0)
    }

    pub fn epoch_count(&self) -> usize {
        self.epochs.len()
    }

    /// Writes not yet retired, across all epochs.
    pub fn in_flight(&self) -> usize {
        self.writes.len()
    }

    /// Append a write to the open epoch.
    pub fn admit(
        &mut self,
        sector: u64,
        length: u32,
        correlation_id: u64,
        disposition: Disposition,
    ) -> WriteHandle {
        let handle = WriteHandle(self.next_handle);
        self.next_handle += 1;

        let barrier_number = self.current_barrier_number();
        self.writes.insert(
            handle.0,
            PendingWrite {
                sector,
                length,
                correlation_id,
                disposition,
                barrier_number,
            },
        );
        self.by_sector.entry(sector).or_default().push(handle);
        if let Some(open) = self.epochs.back_mut() {
            open.admit(handle);
        }
        handle
    }

    /// Close the open epoch and open a new one.
    ///
    /// Returns the closed epoch's barrier number, which is what goes
    /// out in the barrier packet and comes back in the ack.
    pub fn open_barrier(&mut self) -> u32 {
        let closed = self.current_barrier_number();
        self.epochs.push_back(Epoch::new(next_barrier_number(closed)));
        closed
    }

    /// Record local disk completion for a write.
    pub fn local_complete(&mut self, handle: WriteHandle) -> TlogResult<Disposition> {
        let write = self
            .writes
            .get_mut(&handle.0)
            .ok_or(TlogError::UnknownWrite { handle: handle.0 })?;
        let next = match write.disposition {
            Disposition::BothPending => Disposition::RemotePending,
            Disposition::LocalPending => Disposition::Completed,
            other => other,
        };
        write.disposition = next;
        if next == Disposition::Completed {
            self.retire(handle);
        }
        Ok(next)
    }

    /// Record the peer's durability acknowledgement for a write.
    pub fn remote_ack(&mut self, handle: WriteHandle) -> TlogResult<Disposition> {
        let write = self
            .writes
            .get_mut(&handle.0)
            .ok_or(TlogError::UnknownWrite { handle: handle.0 })?;
        let next = match write.disposition {
            Disposition::BothPending => Disposition::LocalPending,
            Disposition::RemotePending => Disposition::Completed,
            other => other,
        };
        write.disposition = next;
        if next == Disposition::Completed {
            self.retire(handle);
        }
        Ok(next)
    }

    /// Retire the oldest outstanding epoch against a barrier ack.
    ///
    /// The ack must name the oldest epoch and carry its exact admission
    /// count; any mismatch is rejected without mutating the log and
    /// must poison the connection. Releasing the last epoch replaces it
    /// with a fresh one in the same call, so the log never holds zero
    /// epochs.
    pub fn release(&mut self, barrier_number: u32, expected_count: u32) -> TlogResult<ReleaseOutcome> {
        let oldest = match self.epochs.front() {
            Some(epoch) => epoch,
            None => {
                return Err(TlogError::BarrierMismatch {
                    oldest: 0,
                    acked: barrier_number,
                })
            }
        };
        if oldest.barrier_number() != barrier_number {
            return Err(TlogError::BarrierMismatch {
                oldest: oldest.barrier_number(),
                acked: barrier_number,
            });
        }
        if oldest.n_req() != expected_count {
            return Err(TlogError::CountMismatch {
                barrier: barrier_number,
                recorded: oldest.n_req(),
                acked: expected_count,
            });
        }

        let mut epoch = match self.epochs.pop_front() {
            Some(epoch) => epoch,
            None => {
                return Err(TlogError::BarrierMismatch {
                    oldest: 0,
                    acked: barrier_number,
                })
            }
        };
        if self.epochs.is_empty() {
            // replace-in-place: the released epoch was also the open one
            self.epochs
                .push_back(Epoch::new(next_barrier_number(barrier_number)));
        }

        let mut outcome = ReleaseOutcome {
            barrier_number,
            retired: epoch.n_req(),
            completed: Vec::new(),
            still_local: 0,
        };
        for handle in epoch.take_writes() {
            let next = match self.writes.get_mut(&handle.0) {
                Some(write) => {
                    // the barrier ack covers the remote side of every
                    // write in the epoch
                    let next = match write.disposition {
                        Disposition::BothPending => Disposition::LocalPending,
                        Disposition::RemotePending => Disposition::Completed,
                        other => other,
                    };
                    write.disposition = next;
                    if next == Disposition::Completed {
                        outcome.completed.push(write.correlation_id);
                    }
                    next
                }
                // already retired by a per-write ack
                None => continue,
            };
            match next {
                Disposition::Completed => self.retire(handle),
                Disposition::LocalPending => {
                    outcome.still_local += 1;
                    self.unsequenced.push(handle);
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Fail every in-flight write and reset to a single empty epoch
    /// with a fresh non-deterministic barrier number.
    ///
    /// The random reseed keeps a reconnecting peer from matching a
    /// stale barrier number it still holds from before the loss.
    pub fn clear_on_disconnect(&mut self) -> Vec<LostWrite> {
        let mut lost = Vec::with_capacity(self.writes.len());
        for write in self.writes.values_mut() {
            write.disposition = Disposition::LostOnDisconnect;
            lost.push(LostWrite {
                sector: write.sector,
                length: write.length,
                correlation_id: write.correlation_id,
            });
        }
        lost.sort_by_key(|w| w.correlation_id);

        self.writes.clear();
        self.by_sector.clear();
        self.unsequenced.clear();
        self.epochs.clear();

        let mut rng = rand::thread_rng();
        let mut reseed: u32 = rng.gen();
        if reseed == 0 {
            reseed = 1;
        }
        self.epochs.push_back(Epoch::new(reseed));
        lost
    }

    /// Look up an in-flight write.
    pub fn get(&self, handle: WriteHandle) -> Option<&PendingWrite> {
        self.writes.get(&handle.0)
    }

    /// Find the in-flight write with the given correlation id.
    pub fn find_by_correlation(&self, correlation_id: u64) -> Option<WriteHandle> {
        self.writes
            .iter()
            .find(|(_, w)| w.correlation_id == correlation_id)
            .map(|(&id, _)| WriteHandle(id))
    }

    /// True if any in-flight write overlaps `[sector, sector + sectors)`.
    pub fn conflicts(&self, sector: u64, sectors: u64) -> bool {
        let end = sector.saturating_add(sectors);
        for (&start, handles) in self.by_sector.range(..end) {
            for handle in handles {
                if let Some(write) = self.writes.get(&handle.0) {
                    let write_end = start + u64::from(write.length.div_ceil(512));
                    if write_end > sector {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn retire(&mut self, handle: WriteHandle) {
        if let Some(write) = self.writes.remove(&handle.0) {
            if let Some(handles) = self.by_sector.get_mut(&write.sector) {
                handles.retain(|h| *h != handle);
                if handles.is_empty() {
                    self.by_sector.remove(&write.sector);
                }
            }
        }
        self.unsequenced.retain(|h| *h != handle);
    }
}

impl Default for TransferLog {
    fn default() -> Self {
        Self::new()
    }
}
