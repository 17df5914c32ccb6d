//! Flat bit-array over atomic 64-bit words, with a block-sampled rank
//! directory.
//!
//! During a level's fill phase many workers set bits concurrently; after
//! `build_ranks` the array is frozen and only read. Allocation always
//! carries one word past the last addressable bit, and that guard word is
//! part of the serialized image, so `rank(size)` stays in bounds.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u64 = 64;
/// One cumulative popcount sample per this many bits.
const BITS_PER_RANK_SAMPLE: u64 = 512;
const WORDS_PER_RANK_SAMPLE: u64 = BITS_PER_RANK_SAMPLE / WORD_BITS;

#[derive(Debug)]
pub struct BitArray {
    size: u64,
    words: Box<[AtomicU64]>,
    ranks: Vec<u64>,
}

impl BitArray {
    /// Zeroed array addressing `n_bits` bits, one tail guard word included.
    pub fn new(n_bits: u64) -> Self {
        let nwords = (n_bits.div_ceil(WORD_BITS) + 1) as usize;
        let mut words = Vec::with_capacity(nwords);
        words.resize_with(nwords, || AtomicU64::new(0));
        Self {
            size: n_bits,
            words: words.into_boxed_slice(),
            ranks: Vec::new(),
        }
    }

    pub(crate) fn from_parts(size: u64, words: Vec<u64>, ranks: Vec<u64>) -> Self {
        let words: Vec<AtomicU64> = words.into_iter().map(AtomicU64::new).collect();
        Self {
            size,
            words: words.into_boxed_slice(),
            ranks,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Bit at `pos`, 0 or 1.
    #[inline]
    pub fn get(&self, pos: u64) -> u64 {
        (self.words[(pos >> 6) as usize].load(Ordering::Relaxed) >> (pos & 63)) & 1
    }

    /// Whole 64-bit cell.
    #[inline]
    pub fn get64(&self, cell: usize) -> u64 {
        self.words[cell].load(Ordering::Relaxed)
    }

    /// Set bit `pos`. Safe to call concurrently; OR is commutative so
    /// relaxed ordering suffices.
    #[inline]
    pub fn set(&self, pos: u64) {
        self.words[(pos >> 6) as usize].fetch_or(1u64 << (pos & 63), Ordering::Relaxed);
    }

    /// Atomically set bit `pos` and return its prior value. The first
    /// caller out of any number of racers observes 0.
    #[inline]
    pub fn atomic_test_and_set(&self, pos: u64) -> u64 {
        let mask = 1u64 << (pos & 63);
        let word = &self.words[(pos >> 6) as usize];
        let mut old = word.load(Ordering::SeqCst);
        while let Err(cur) =
            word.compare_exchange_weak(old, old | mask, Ordering::SeqCst, Ordering::SeqCst)
        {
            old = cur;
        }
        (old >> (pos & 63)) & 1
    }

    /// Zero every word, guard included.
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Zero `len` bits starting at `start`; both must be 64-aligned.
    pub fn clear_range(&self, start: u64, len: u64) {
        assert_eq!(start & 63, 0, "clear_range start must be 64-aligned");
        assert_eq!(len & 63, 0, "clear_range len must be 64-aligned");
        let first = (start / WORD_BITS) as usize;
        for ii in 0..(len / WORD_BITS) as usize {
            self.words[first + ii].store(0, Ordering::Relaxed);
        }
    }

    /// `self &= !collisions` over `len` bits starting at `start` (both
    /// 64-aligned), then zero the collision array. Only positions hit by
    /// exactly one key in the fill phase survive.
    pub fn clear_collisions(&self, start: u64, len: u64, collisions: &BitArray) {
        assert_eq!(start & 63, 0, "clear_collisions start must be 64-aligned");
        assert_eq!(len & 63, 0, "clear_collisions len must be 64-aligned");
        let first = (start / WORD_BITS) as usize;
        for ii in 0..(len / WORD_BITS) as usize {
            let keep = !collisions.get64(ii);
            let w = &self.words[first + ii];
            w.store(w.load(Ordering::Relaxed) & keep, Ordering::Relaxed);
        }
        collisions.clear();
    }

    /// Number of set bits in the whole array.
    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    /// Sample cumulative popcounts every 512 bits, seeding the count with
    /// `offset`. Returns the final cumulative rank (`offset` plus the
    /// total popcount); the array is frozen afterwards.
    pub fn build_ranks(&mut self, offset: u64) -> u64 {
        self.ranks = Vec::with_capacity((2 + self.size / BITS_PER_RANK_SAMPLE) as usize);
        let mut rank = offset;
        for (ii, w) in self.words.iter().enumerate() {
            if (ii as u64 * WORD_BITS) % BITS_PER_RANK_SAMPLE == 0 {
                self.ranks.push(rank);
            }
            rank += w.load(Ordering::Relaxed).count_ones() as u64;
        }
        rank
    }

    /// Number of set bits strictly before `pos`, plus the offset supplied
    /// to `build_ranks`. `pos == size` is valid thanks to the guard word.
    pub fn rank(&self, pos: u64) -> u64 {
        debug_assert!(pos <= self.size);
        let word_idx = (pos / WORD_BITS) as usize;
        let block = (pos / BITS_PER_RANK_SAMPLE) as usize;
        let mut r = self.ranks[block];
        for w in (block * WORDS_PER_RANK_SAMPLE as usize)..word_idx {
            r += self.words[w].load(Ordering::Relaxed).count_ones() as u64;
        }
        let mask = (1u64 << (pos & 63)) - 1;
        r + (self.words[word_idx].load(Ordering::Relaxed) & mask).count_ones() as u64
    }

    pub(crate) fn rank_dir(&self) -> &[u64] {
        &self.ranks
    }

    /// Bits occupied by the array and its rank directory.
    pub fn bit_size(&self) -> u64 {
        (self.words.len() as u64 + self.ranks.len() as u64) * WORD_BITS
    }
}

impl Clone for BitArray {
    fn clone(&self) -> Self {
        let words: Vec<AtomicU64> = self
            .words
            .iter()
            .map(|w| AtomicU64::new(w.load(Ordering::Relaxed)))
            .collect();
        Self {
            size: self.size,
            words: words.into_boxed_slice(),
            ranks: self.ranks.clone(),
        }
    }
}
