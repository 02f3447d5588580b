//! Lock-free tile validity bitset
//!
//! A fixed-size bit vector backed by atomic words. Every operation touches
//! individual words atomically, so any number of render workers can set and
//! clear bits concurrently without a lock. Overlapping writers on the same
//! bit race last-store-wins; validity is reconciled by the next re-render.

use std::ops::Index;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = u64::BITS as usize;
const ALL_BITS: u64 = !0;

/// Fixed-capacity atomic bitset, all bits initially unset.
///
/// The capacity cannot change in place. Callers that need a different size
/// build a new bitset and swap it in. The `Default` value has zero capacity
/// and any indexed access on it fails fast.
///
/// # Example
///
/// ```
/// use doctile_cache::AtomicBitset;
///
/// let bits = AtomicBitset::new(100);
/// assert!(!bits.set(42));
/// assert!(bits.is_set(42));
/// bits.reset_range(40, 50);
/// assert!(!bits.is_set(42));
/// ```
#[derive(Debug, Default)]
pub struct AtomicBitset {
    len: usize,
    words: Box<[AtomicU64]>,
}

impl AtomicBitset {
    /// Create a bitset holding `len` bits, all unset.
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { len, words }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the bit at `index`, returning its previous value.
    pub fn set(&self, index: usize) -> bool {
        let mask = self.mask_for(index);
        self.words[word_index(index)].fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    /// Clear the bit at `index`, returning its previous value.
    pub fn reset(&self, index: usize) -> bool {
        let mask = self.mask_for(index);
        self.words[word_index(index)].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        let mask = self.mask_for(index);
        self.words[word_index(index)].load(Ordering::SeqCst) & mask != 0
    }

    /// Clear every bit in the inclusive range `[start, end]`.
    ///
    /// A range inside one word is a single masked `fetch_and`. A range spanning
    /// several words clears the partial first word, stores zero into each whole
    /// interior word and clears the partial last word, so invalidating a large
    /// band costs one atomic op per word rather than per bit.
    pub fn reset_range(&self, start: usize, end: usize) {
        assert!(start <= end, "malformed bit range {start}..={end}");
        assert!(
            end < self.len,
            "bit range end {end} out of bounds for bitset of {} bits",
            self.len
        );

        let first_word = word_index(start);
        let last_word = word_index(end);
        let low = ALL_BITS << bit_index(start);
        let high = ALL_BITS >> (BITS_PER_WORD - 1 - bit_index(end));

        if first_word == last_word {
            self.words[first_word].fetch_and(!(low & high), Ordering::SeqCst);
            return;
        }

        self.words[first_word].fetch_and(!low, Ordering::SeqCst);
        for word in &self.words[first_word + 1..last_word] {
            word.store(0, Ordering::SeqCst);
        }
        self.words[last_word].fetch_and(!high, Ordering::SeqCst);
    }

    /// Clear every bit.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::SeqCst);
        }
    }

    /// Number of set bits. Only a point-in-time estimate under concurrent writes.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }

    fn mask_for(&self, index: usize) -> u64 {
        assert!(
            index < self.len,
            "bit index {index} out of bounds for bitset of {} bits",
            self.len
        );
        1 << bit_index(index)
    }
}

/// `bits[i]` reads bit `i`, with the same bounds check as [`AtomicBitset::is_set`].
impl Index<usize> for AtomicBitset {
    type Output = bool;

    fn index(&self, index: usize) -> &bool {
        if self.is_set(index) {
            &true
        } else {
            &false
        }
    }
}

fn word_index(index: usize) -> usize {
    index / BITS_PER_WORD
}

fn bit_index(index: usize) -> usize {
    index % BITS_PER_WORD
}
