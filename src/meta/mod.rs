//! Persistent device metadata
//!
//! The generation UUID chains and the fixed 512-byte on-disk record
//! that carries them, together with the agreed size, persistent flags
//! and the metadata-area geometry.

mod errors;
mod superblock;
mod uuids;

pub use errors::{MetaError, MetaResult};
pub use superblock::{
    MetaGeometry, Superblock, FLAG_CONSISTENT, FLAG_CRASHED_PRIMARY, FLAG_FULL_SYNC_PENDING,
    FLAG_PEER_OUTDATED, FLAG_WAS_CONNECTED, FLAG_WAS_PRIMARY, FLAG_WAS_UP_TO_DATE,
    META_BLOCK_SIZE, META_MAGIC,
};
pub use uuids::{
    uuid_key, UuidSet, HISTORY_SLOTS, UUID_FLAG_CRASHED_PRIMARY, UUID_FLAG_DISCARD_LOCAL,
    UUID_FLAG_INCONSISTENT, UUID_FLAG_SKIP_INITIAL_SYNC,
};
