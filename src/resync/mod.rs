//! Resynchronization
//!
//! Decides on reconnect whether the replicas need no sync, a partial
//! bitmap-driven sync or a full copy, which side sends, and then walks
//! the dirty bitmap in bounded chunks until the copies converge.

mod coordinator;
mod decide;
mod errors;

pub use coordinator::{ResyncChunk, ResyncCoordinator, ResyncPhase, ResyncProgress};
pub use decide::{decide, PeerUuids, SyncDecision, SyncDirection};
pub use errors::{ResyncError, ResyncResult};
