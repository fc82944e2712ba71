//! Pluggable digest functions
//!
//! Replicated write payloads can carry a trailing digest when integrity
//! checking is negotiated. The engine does not care which algorithm is
//! behind the seam; CRC32 is the cheap default, SHA-256 the strong
//! option.

use sha2::{Digest as _, Sha256};

/// A digest over a byte buffer with a fixed output size.
pub trait Digest: Send + Sync {
    /// Output size in bytes.
    fn digest_len(&self) -> usize;

    /// Compute the digest of `data`.
    fn compute(&self, data: &[u8]) -> Vec<u8>;

    /// Verify `data` against an `expected` digest.
    fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        self.compute(data) == expected
    }
}

/// CRC32 (IEEE polynomial), 4-byte output, big-endian on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Digest;

impl Digest for Crc32Digest {
    fn digest_len(&self) -> usize {
        4
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize().to_be_bytes().to_vec()
    }
}

/// SHA-256, 32-byte output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn digest_len(&self) -> usize {
        32
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}
