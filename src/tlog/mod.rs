//! Transfer log
//!
//! Tracks in-flight replicated writes and enforces write ordering
//! across the link with barriers. Writes admitted between two barriers
//! form an epoch; the peer acknowledges a barrier only after admitting
//! everything before it, and the log retires the epoch against that
//! ack. Connection loss fails the whole log at once.

mod epoch;
mod errors;
mod log;

pub use epoch::{next_barrier_number, Epoch, INITIAL_BARRIER_NUMBER};
pub use errors::{TlogError, TlogResult};
pub use log::{
    Disposition, LostWrite, PendingWrite, ReleaseOutcome, TransferLog, WriteHandle,
};
