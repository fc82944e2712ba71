//! Dirty-block bitmap
//!
//! One bit per device block. Bits are set while the peer cannot be
//! reached (or is known stale) and cleared as resynchronization brings
//! the copies back together. The bitmap is also what crosses the wire
//! on reconnect, so it carries a run-length + variable-length-integer
//! codec with a plain fallback for incompressible regions.

mod encode;
mod errors;
mod store;

pub use encode::{
    decode_chunk, decode_plain, encode_chunk, plain_chunk, ChunkOutcome, DecodeState,
    EncodedChunk, PlainChunk, DEFAULT_MAX_CHUNK_BYTES,
};
pub use errors::{BitmapError, BitmapResult};
pub use store::BitmapStore;
