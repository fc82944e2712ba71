//! Dense dirty/clean bit storage with a maintained weight

use super::errors::{BitmapError, BitmapResult};
use std::ops::Range;

const BITS_PER_WORD: u64 = 64;

/// Per-block dirty bitmap covering the whole device.
///
/// Supports concurrent read (weight, scan, encode) under a shared
/// borrow and exclusive write (mark/clear); the embedding layer wraps
/// it in a reader-writer lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapStore {
    words: Vec<u64>,
    blocks: u64,
    /// Count of set bits, maintained incrementally so `weight()` is O(1).
    weight: u64,
}

impl BitmapStore {
    /// Create an all-clean bitmap of `blocks` bits.
    pub fn new(blocks: u64) -> Self {
        let words = blocks.div_ceil(BITS_PER_WORD) as usize;
        Self {
            words: vec![0; words],
            blocks,
            weight: 0,
        }
    }

    /// Bitmap size in blocks.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Count of dirty blocks.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Mark the whole device dirty. Idempotent.
    pub fn set_all(&mut self) {
        for word in &mut self.words {
            *word = u64::MAX;
        }
        self.mask_tail();
        self.weight = self.blocks;
    }

    /// Mark the whole device clean. Idempotent.
    pub fn clear_all(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
        self.weight = 0;
    }

    /// True if `block` is dirty.
    pub fn is_dirty(&self, block: u64) -> bool {
        debug_assert!(block < self.blocks);
        let word = self.words[(block / BITS_PER_WORD) as usize];
        word & (1 << (block % BITS_PER_WORD)) != 0
    }

    /// Mark `range` dirty.
    pub fn mark_dirty(&mut self, range: Range<u64>) -> BitmapResult<()> {
        self.check_range(&range)?;
        for block in range {
            let idx = (block / BITS_PER_WORD) as usize;
            let mask = 1 << (block % BITS_PER_WORD);
            if self.words[idx] & mask == 0 {
                self.words[idx] |= mask;
                self.weight += 1;
            }
        }
        Ok(())
    }

    /// Mark `range` clean.
    pub fn clear(&mut self, range: Range<u64>) -> BitmapResult<()> {
        self.check_range(&range)?;
        for block in range {
            let idx = (block / BITS_PER_WORD) as usize;
            let mask = 1 << (block % BITS_PER_WORD);
            if self.words[idx] & mask != 0 {
                self.words[idx] &= !mask;
                self.weight -= 1;
            }
        }
        Ok(())
    }

    /// First dirty block at or after `from`, if any.
    pub fn first_dirty_at_or_after(&self, from: u64) -> Option<u64> {
        let mut block = from;
        while block < self.blocks {
            let idx = (block / BITS_PER_WORD) as usize;
            let shifted = self.words[idx] >> (block % BITS_PER_WORD);
            if shifted == 0 {
                // skip to the next word boundary
                block = (block / BITS_PER_WORD + 1) * BITS_PER_WORD;
                continue;
            }
            let hit = block + shifted.trailing_zeros() as u64;
            return if hit < self.blocks { Some(hit) } else { None };
        }
        None
    }

    /// Length of the run of identical bits starting at `from`, capped
    /// at the end of the bitmap.
    pub fn run_length_at(&self, from: u64) -> u64 {
        debug_assert!(from < self.blocks);
        let value = self.is_dirty(from);
        let mut block = from + 1;
        while block < self.blocks && self.is_dirty(block) == value {
            block += 1;
        }
        block - from
    }

    /// Raw words backing the bitmap; used by the plain wire fallback.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Overwrite a word-aligned region from raw words, recomputing the
    /// weight. Used when applying a plain (uncompressed) chunk.
    pub fn write_words(&mut self, word_offset: usize, words: &[u64]) -> BitmapResult<()> {
        let end = word_offset + words.len();
        if end > self.words.len() {
            return Err(BitmapError::Overrun {
                position: end as u64 * BITS_PER_WORD,
                blocks: self.blocks,
            });
        }
        self.words[word_offset..end].copy_from_slice(words);
        self.mask_tail();
        self.weight = self.words.iter().map(|w| w.count_ones() as u64).sum();
        Ok(())
    }

    /// Union another bitmap of the same size into this one. Used when
    /// merging the peer's dirty set on reconnect: a block dirty on
    /// either side must travel.
    pub fn merge(&mut self, other: &BitmapStore) -> BitmapResult<()> {
        if other.blocks != self.blocks {
            return Err(BitmapError::OutOfBounds {
                block: 0,
                count: other.blocks,
                blocks: self.blocks,
            });
        }
        for (word, o) in self.words.iter_mut().zip(&other.words) {
            *word |= o;
        }
        self.weight = self.words.iter().map(|w| w.count_ones() as u64).sum();
        Ok(())
    }

    fn check_range(&self, range: &Range<u64>) -> BitmapResult<()> {
        if range.end > self.blocks || range.start > range.end {
            return Err(BitmapError::OutOfBounds {
                block: range.start,
                count: range.end.saturating_sub(range.start),
                blocks: self.blocks,
            });
        }
        Ok(())
    }

    /// Clear bits past `blocks` in the last word so weight accounting
    /// and word-level operations stay exact.
    fn mask_tail(&mut self) {
        let tail_bits = self.blocks % BITS_PER_WORD;
        if tail_bits != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail_bits) - 1;
            }
        }
    }
}
