//! Run-length + variable-length-integer bitmap codec
//!
//! A compressed chunk is a starts-with-set-bit flag followed by run
//! lengths of alternating bit values, each run length written as a
//! base-128 variable-length integer (7 data bits per byte, high bit is
//! the continuation flag). A chunk that does not compress below the
//! plain representation of the bits it covers is rejected by the
//! encoder; the caller falls back to [`plain_chunk`] for that region.
//!
//! Decoding is strict: a zero run length is only legal as the very
//! first run of the stream (it lets a producer whose first run is
//! pinned to the clean parity express a bitmap that starts dirty).
//! Everywhere else a zero run is producer corruption and fatal.

use super::errors::{BitmapError, BitmapResult};
use super::store::BitmapStore;

/// Default negotiated upper bound for one encoded chunk.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4096;

/// One compressed bitmap chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Bit value of the first run.
    pub start_is_set: bool,
    /// Concatenated variable-length run lengths.
    pub runs: Vec<u8>,
    /// Number of blocks the runs cover.
    pub covered: u64,
}

/// One plain (uncompressed) chunk: raw words at a word offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainChunk {
    /// Offset into the bitmap's word array.
    pub word_offset: usize,
    /// Raw 64-bit words.
    pub words: Vec<u64>,
}

/// Result of encoding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The region compressed; send this chunk.
    Compressed {
        chunk: EncodedChunk,
        /// First block not covered by this chunk.
        cursor: u64,
        /// True once the whole bitmap has been consumed.
        finished: bool,
    },
    /// The region did not beat the plain representation; the caller
    /// must fall back to [`plain_chunk`] from the same cursor.
    Incompressible,
}

/// Decoder-side position tracking across chunks of one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeState {
    /// Next bitmap position to be written.
    pub position: u64,
    /// Chunks applied so far.
    pub chunks: usize,
}

impl DecodeState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Encode one bounded chunk starting at `cursor`.
///
/// The chunk holds as many whole runs as fit into `max_bytes` (one
/// byte of which is accounted to the flag carried in the framing).
pub fn encode_chunk(store: &BitmapStore, cursor: u64, max_bytes: usize) -> ChunkOutcome {
    debug_assert!(cursor < store.blocks());
    let start_is_set = store.is_dirty(cursor);
    let mut runs = Vec::new();
    let mut position = cursor;

    while position < store.blocks() {
        let run = store.run_length_at(position);
        let mut encoded = Vec::with_capacity(10);
        push_vli(&mut encoded, run);
        // +1 accounts for the flag byte in the wire framing
        if runs.len() + encoded.len() + 1 > max_bytes && !runs.is_empty() {
            break;
        }
        runs.extend_from_slice(&encoded);
        position += run;
    }

    let covered = position - cursor;
    let bytes_used = runs.len() + 1;
    if (bytes_used as u64) * 8 >= covered {
        return ChunkOutcome::Incompressible;
    }

    ChunkOutcome::Compressed {
        chunk: EncodedChunk {
            start_is_set,
            runs,
            covered,
        },
        cursor: position,
        finished: position >= store.blocks(),
    }
}

/// Produce a plain fallback chunk starting at the word containing
/// `cursor`. Returns the chunk, the advanced cursor and the finished
/// flag.
pub fn plain_chunk(store: &BitmapStore, cursor: u64, max_bytes: usize) -> (PlainChunk, u64, bool) {
    let word_offset = (cursor / 64) as usize;
    let max_words = (max_bytes / 8).max(1);
    let end = (word_offset + max_words).min(store.words().len());
    let words = store.words()[word_offset..end].to_vec();
    let new_cursor = ((end as u64) * 64).min(store.blocks());
    (
        PlainChunk { word_offset, words },
        new_cursor,
        new_cursor >= store.blocks(),
    )
}

/// Apply one compressed chunk to `store`, advancing `state`.
///
/// Returns true once the whole bitmap has been received.
pub fn decode_chunk(
    store: &mut BitmapStore,
    state: &mut DecodeState,
    chunk: &EncodedChunk,
    max_bytes: usize,
) -> BitmapResult<bool> {
    if chunk.runs.len() + 1 > max_bytes {
        return Err(BitmapError::ChunkTooLarge {
            len: chunk.runs.len() + 1,
            max: max_bytes,
        });
    }

    let mut offset = 0usize;
    let mut run_index = 0usize;
    let mut value = chunk.start_is_set;

    while offset < chunk.runs.len() {
        let run = read_vli(&chunk.runs, &mut offset)?;
        if run == 0 && !(run_index == 0 && state.position == 0) {
            return Err(BitmapError::ZeroRunLength {
                run_index,
                position: state.position,
            });
        }

        let end = state.position.checked_add(run).ok_or(BitmapError::Overrun {
            position: u64::MAX,
            blocks: store.blocks(),
        })?;
        if end > store.blocks() {
            return Err(BitmapError::Overrun {
                position: end,
                blocks: store.blocks(),
            });
        }

        if value {
            store.mark_dirty(state.position..end)?;
        } else {
            store.clear(state.position..end)?;
        }
        state.position = end;
        value = !value;
        run_index += 1;
    }

    state.chunks += 1;
    Ok(state.position >= store.blocks())
}

/// Apply one plain chunk to `store`, advancing `state`.
pub fn decode_plain(
    store: &mut BitmapStore,
    state: &mut DecodeState,
    chunk: &PlainChunk,
) -> BitmapResult<bool> {
    store.write_words(chunk.word_offset, &chunk.words)?;
    let end = ((chunk.word_offset + chunk.words.len()) as u64 * 64).min(store.blocks());
    state.position = state.position.max(end);
    state.chunks += 1;
    Ok(state.position >= store.blocks())
}

fn push_vli(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_vli(data: &[u8], offset: &mut usize) -> BitmapResult<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*offset).ok_or(BitmapError::TruncatedChunk)?;
        *offset += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(BitmapError::TruncatedChunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(source: &BitmapStore, max_bytes: usize) -> BitmapStore {
        let mut target = BitmapStore::new(source.blocks());
        let mut state = DecodeState::new();
        let mut cursor = 0u64;
        loop {
            match encode_chunk(source, cursor, max_bytes) {
                ChunkOutcome::Compressed {
                    chunk,
                    cursor: next,
                    finished,
                } => {
                    let done = decode_chunk(&mut target, &mut state, &chunk, max_bytes).unwrap();
                    cursor = next;
                    if finished {
                        assert!(done, "decoder must agree the bitmap is complete");
                        break;
                    }
                }
                ChunkOutcome::Incompressible => {
                    let (chunk, next, finished) = plain_chunk(source, cursor, max_bytes);
                    decode_plain(&mut target, &mut state, &chunk).unwrap();
                    cursor = next;
                    if finished {
                        break;
                    }
                }
            }
        }
        target
    }

    #[test]
    fn test_roundtrip_sparse_bitmap() {
        let mut bm = BitmapStore::new(10_000);
        bm.mark_dirty(100..228).unwrap();
        bm.mark_dirty(4096..4100).unwrap();
        bm.mark_dirty(9_990..10_000).unwrap();

        let decoded = roundtrip(&bm, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(decoded, bm, "decode(encode(B)) must equal B bit for bit");
    }

    #[test]
    fn test_roundtrip_all_dirty() {
        let mut bm = BitmapStore::new(5_000);
        bm.set_all();
        let decoded = roundtrip(&bm, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(decoded.weight(), 5_000);
    }

    #[test]
    fn test_roundtrip_all_clean() {
        let bm = BitmapStore::new(5_000);
        let decoded = roundtrip(&bm, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(decoded.weight(), 0);
    }

    #[test]
    fn test_alternating_bits_are_incompressible() {
        let mut bm = BitmapStore::new(1_024);
        for block in (0..1_024).step_by(2) {
            bm.mark_dirty(block..block + 1).unwrap();
        }
        assert_eq!(
            encode_chunk(&bm, 0, DEFAULT_MAX_CHUNK_BYTES),
            ChunkOutcome::Incompressible,
            "one byte per bit can never beat the plain encoding"
        );

        // the plain fallback still round-trips
        let decoded = roundtrip(&bm, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(decoded, bm);
    }

    #[test]
    fn test_small_chunks_force_multiple_chunks() {
        let mut bm = BitmapStore::new(100_000);
        let mut block = 0;
        while block < 100_000 {
            bm.mark_dirty(block..block + 50).unwrap();
            block += 1_000;
        }
        let decoded = roundtrip(&bm, 64);
        assert_eq!(decoded, bm);
    }

    #[test]
    fn test_zero_run_rejected_past_start() {
        let mut target = BitmapStore::new(1_000);
        let mut state = DecodeState::new();

        let mut runs = Vec::new();
        push_vli(&mut runs, 10); // clean
        push_vli(&mut runs, 0); // corrupt
        let chunk = EncodedChunk {
            start_is_set: false,
            runs,
            covered: 10,
        };
        let err = decode_chunk(&mut target, &mut state, &chunk, DEFAULT_MAX_CHUNK_BYTES)
            .unwrap_err();
        assert!(matches!(err, BitmapError::ZeroRunLength { run_index: 1, .. }));
    }

    #[test]
    fn test_zero_run_allowed_as_very_first_run() {
        // a producer pinned to clean-first parity encodes a bitmap that
        // starts dirty as: 0 clean, then N dirty
        let mut target = BitmapStore::new(64);
        let mut state = DecodeState::new();

        let mut runs = Vec::new();
        push_vli(&mut runs, 0);
        push_vli(&mut runs, 8);
        let chunk = EncodedChunk {
            start_is_set: false,
            runs,
            covered: 8,
        };
        decode_chunk(&mut target, &mut state, &chunk, DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(target.weight(), 8);
        assert!(target.is_dirty(0));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut target = BitmapStore::new(64);
        let mut state = DecodeState::new();
        let chunk = EncodedChunk {
            start_is_set: false,
            runs: vec![1; 128],
            covered: 0,
        };
        let err = decode_chunk(&mut target, &mut state, &chunk, 64).unwrap_err();
        assert!(matches!(err, BitmapError::ChunkTooLarge { .. }));
    }

    #[test]
    fn test_truncated_vli_rejected() {
        let mut target = BitmapStore::new(64);
        let mut state = DecodeState::new();
        let chunk = EncodedChunk {
            start_is_set: true,
            runs: vec![0x80], // continuation bit with no next byte
            covered: 0,
        };
        let err = decode_chunk(&mut target, &mut state, &chunk, DEFAULT_MAX_CHUNK_BYTES)
            .unwrap_err();
        assert_eq!(err, BitmapError::TruncatedChunk);
    }

    #[test]
    fn test_overrun_rejected() {
        let mut target = BitmapStore::new(16);
        let mut state = DecodeState::new();
        let mut runs = Vec::new();
        push_vli(&mut runs, 32);
        let chunk = EncodedChunk {
            start_is_set: true,
            runs,
            covered: 32,
        };
        let err = decode_chunk(&mut target, &mut state, &chunk, DEFAULT_MAX_CHUNK_BYTES)
            .unwrap_err();
        assert!(matches!(err, BitmapError::Overrun { .. }));
    }

    #[test]
    fn test_vli_roundtrip_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            push_vli(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_vli(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }
}
