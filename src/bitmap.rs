//! Two-level free-block bitmap
//!
//! Since modern CPUs are not bit-addressable, arrays of 64-bit words are used
//! as vectors of bits. An arena tracks its recycled blocks with two of them:
//!
//! - The L2 bitmap has one bit per block, which is set when the block is free.
//! - The L1 bitmap has one bit per run of `L2_WORDS_PER_L1_BIT` L2 words, which
//!   is set when that run (which we call a **region**) may contain a free block.
//!
//! A zeroed bitmap means "nothing was ever freed", which is exactly the state
//! of a fresh arena whose blocks are all still reachable by bump allocation.

use crate::{div_round_up, policy::{Policy, Slot}};

use crossbeam_utils::CachePadded;

use std::{
    mem,
    ptr::NonNull,
    slice,
    sync::atomic::Ordering,
};


/// Number of bits in a bitmap word
pub const BITS_PER_WORD: usize = 64;

/// Number of L2 bitmap words summarized by each L1 bitmap bit
pub const L2_WORDS_PER_L1_BIT: usize = 64;


/// Word counts of a two-level bitmap tracking a given number of blocks
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BitmapLayout {
    /// Number of words in the L2 (one bit per block) bitmap
    pub l2_words: usize,

    /// Number of meaningful bits in the L1 (one bit per region) bitmap
    pub l1_bits: usize,

    /// Number of words in the L1 bitmap
    pub l1_words: usize,
}

impl BitmapLayout {
    /// Compute the layout needed to track `num_blocks` blocks
    pub fn for_blocks(num_blocks: usize) -> Self {
        debug_assert_ne!(num_blocks, 0, "A bitmap must track at least one block");
        let l2_words = div_round_up(num_blocks, BITS_PER_WORD);
        let l1_bits = div_round_up(l2_words, L2_WORDS_PER_L1_BIT);
        let l1_words = div_round_up(l1_bits, BITS_PER_WORD);
        Self { l2_words, l1_bits, l1_words }
    }

    /// Total number of words (L2 words first, then L1 words)
    pub fn num_words(&self) -> usize {
        self.l2_words + self.l1_words
    }

    /// Storage footprint in bytes
    pub fn num_bytes(&self) -> usize {
        self.num_words() * mem::size_of::<u64>()
    }
}


/// Mask with only the bit at `bit` set
#[inline]
fn bit_mask(bit: usize) -> u64 {
    debug_assert!(bit < BITS_PER_WORD, "Bit index is out of word range");
    1 << bit
}


/// Two-level free bitmap living in externally owned storage
///
/// The storage is borrowed from the owner of the bitmap (an arena keeps it at
/// the end of its memory region), which must keep it alive for as long as the
/// bitmap is in use.
pub struct FreeBitmap<P: Policy> {
    /// First L2 word; L1 words follow the L2 words
    words: NonNull<P::Word>,

    /// Word counts
    layout: BitmapLayout,

    /// Number of blocks that may be marked free
    num_blocks: usize,

    /// Round-robin counter picking the starting point of each search
    search_count: CachePadded<P::Counter>,
}

impl<P: Policy> FreeBitmap<P> {
    /// Build a bitmap on top of `layout.num_words()` words at `words`
    ///
    /// # Safety
    ///
    /// `words` must be valid for reads and writes of `layout.num_words()`
    /// properly aligned `P::Word`s for the whole lifetime of the bitmap, all of
    /// them initialized to zero, and must not be accessed by anything else.
    /// `layout` must be `BitmapLayout::for_blocks(n)` for some `n` greater than
    /// or equal to `num_blocks`.
    pub unsafe fn from_raw(words: NonNull<P::Word>,
                           layout: BitmapLayout,
                           num_blocks: usize) -> Self {
        debug_assert!(num_blocks <= layout.l2_words * BITS_PER_WORD,
                      "Bitmap layout is too small for the requested block count");
        debug_assert_eq!(words.as_ptr() as usize % mem::align_of::<P::Word>(), 0,
                         "Bitmap storage is misaligned");
        Self {
            words,
            layout,
            num_blocks,
            search_count: CachePadded::new(P::Counter::new(0)),
        }
    }

    /// Number of blocks tracked by this bitmap
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// The L2 bitmap, one bit per block
    fn l2(&self) -> &[P::Word] {
        // This is safe because of the `from_raw()` contract
        unsafe { slice::from_raw_parts(self.words.as_ptr(), self.layout.l2_words) }
    }

    /// The L1 bitmap, one bit per region of L2 words
    fn l1(&self) -> &[P::Word] {
        // This is safe because of the `from_raw()` contract, the L1 words being
        // stored right after the L2 words.
        unsafe {
            slice::from_raw_parts(self.words.as_ptr().add(self.layout.l2_words),
                                  self.layout.l1_words)
        }
    }

    /// Mark a block as free
    ///
    /// The freed block becomes claimable by any thread that subsequently
    /// observes the bitmap, together with every write made to it beforehand.
    pub fn release(&self, block_idx: usize) {
        debug_assert!(block_idx < self.num_blocks, "Block index is out of range");
        let l2_idx = block_idx / BITS_PER_WORD;
        let mask = bit_mask(block_idx % BITS_PER_WORD);
        let old_word = self.l2()[l2_idx].fetch_or(mask, Ordering::Release);
        debug_assert_eq!(old_word & mask, 0,
                         "Tried to release a block which was already free");

        // Setting the summary bit is always correct since the region now has
        // at least one free block.
        let region_idx = l2_idx / L2_WORDS_PER_L1_BIT;
        self.l1()[region_idx / BITS_PER_WORD]
            .fetch_or(bit_mask(region_idx % BITS_PER_WORD), Ordering::Release);
    }

    /// Try to claim a free block, returning its index
    ///
    /// Each call starts at a different L1 bit, in round-robin fashion, so that
    /// concurrent callers spread over the bitmap instead of all fighting over
    /// the first free block. The whole L1 bitmap is scanned at most once.
    pub fn claim(&self) -> Option<usize> {
        let counter = self.search_count.fetch_add(1, Ordering::Relaxed);
        let start_bit = counter % self.layout.l1_bits;
        let start_word = start_bit / BITS_PER_WORD;
        let start_mask = !0u64 << (start_bit % BITS_PER_WORD);

        // The starting word is visited twice: its bits at and after start_bit
        // first, and the bits before start_bit at the very end.
        let l1 = self.l1();
        for step in 0..=self.layout.l1_words {
            let word_idx = (start_word + step) % self.layout.l1_words;
            let mask = if step == 0 {
                start_mask
            } else if step == self.layout.l1_words {
                !start_mask
            } else {
                !0
            };

            let mut summary = l1[word_idx].load(Ordering::Acquire) & mask;
            while summary != 0 {
                let region_idx =
                    word_idx * BITS_PER_WORD + summary.trailing_zeros() as usize;
                if let Some(block_idx) = self.claim_in_region(region_idx) {
                    return Some(block_idx);
                }
                summary &= summary - 1;
            }
        }
        None
    }

    /// Try to claim a free block within a region of the L2 bitmap
    fn claim_in_region(&self, region_idx: usize) -> Option<usize> {
        let l2 = self.l2();
        let region_start = region_idx * L2_WORDS_PER_L1_BIT;
        let region_end = (region_start + L2_WORDS_PER_L1_BIT).min(l2.len());
        for l2_idx in region_start..region_end {
            let word = &l2[l2_idx];
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let block_idx = l2_idx * BITS_PER_WORD + bit;
                debug_assert!(block_idx < self.num_blocks,
                              "Free bit set for a block beyond the arena's end");
                let remaining = bits & !bit_mask(bit);
                match word.compare_exchange_weak(bits,
                                                 remaining,
                                                 Ordering::AcqRel,
                                                 Ordering::Acquire) {
                    Ok(_) => {
                        if remaining == 0 {
                            self.refresh_summary(region_idx);
                        }
                        return Some(block_idx);
                    }
                    Err(observed) => bits = observed,
                }
            }
        }
        None
    }

    /// Clear the L1 bit of a region if none of its L2 words has a free bit
    fn refresh_summary(&self, region_idx: usize) {
        let summary = &self.l1()[region_idx / BITS_PER_WORD];
        let mask = bit_mask(region_idx % BITS_PER_WORD);
        if self.region_has_free(region_idx) {
            return;
        }

        // A release may have landed between the scan and the clearing, and
        // its summary bit must not be lost, so scan again afterwards.
        summary.fetch_and(!mask, Ordering::AcqRel);
        if self.region_has_free(region_idx) {
            summary.fetch_or(mask, Ordering::Release);
        }
    }

    /// Truth that some L2 word of a region has a free bit
    fn region_has_free(&self, region_idx: usize) -> bool {
        let l2 = self.l2();
        let region_start = region_idx * L2_WORDS_PER_L1_BIT;
        let region_end = (region_start + L2_WORDS_PER_L1_BIT).min(l2.len());
        l2[region_start..region_end].iter()
                                    .any(|word| word.load(Ordering::Acquire) != 0)
    }

    /// Truth that some region may contain a free block
    ///
    /// This is only a hint when other threads are concurrently claiming and
    /// releasing blocks.
    pub fn has_free(&self) -> bool {
        self.l1().iter().any(|word| word.load(Ordering::Relaxed) != 0)
    }
}

impl<P: Policy> std::fmt::Debug for FreeBitmap<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeBitmap")
         .field("layout", &self.layout)
         .field("num_blocks", &self.num_blocks)
         .finish()
    }
}
