//! Block-storage backend seam
//!
//! The engine never talks to a host block device directly. It goes
//! through [`BlockStorage`], which exposes exactly the three operations
//! the core needs: read by sector, write by sector, durable flush.
//!
//! [`MemoryDisk`] is the in-process implementation used by the test
//! suites and by embedders that want a volatile replica.

mod backend;
mod digest;
mod errors;

pub use backend::{BlockStorage, MemoryDisk, SECTOR_SIZE};
pub use digest::{Crc32Digest, Digest, Sha256Digest};
pub use errors::{StorageError, StorageResult};
