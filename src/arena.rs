//! Fixed-size regions of OS memory, divided into equal blocks
//!
//! An arena serves blocks of a single size in two phases. While its bump
//! cursor has not reached the end of the usable space, every allocation simply
//! takes the next never-used block. Afterwards, allocations recycle blocks that
//! were freed by searching the arena's two-level free bitmap, which is stored
//! at the end of the arena's own memory region.

use crate::{
    bitmap::{BitmapLayout, FreeBitmap},
    error::AllocError,
    os::Mapping,
    policy::{Policy, Slot},
};

use crossbeam_utils::CachePadded;

use tracing::debug;

use std::{
    fmt,
    mem,
    ptr::NonNull,
    sync::atomic::Ordering,
};


/// Size of the memory region owned by each arena (in bytes)
pub const ARENA_SIZE: usize = 64 * 1024 * 1024;


/// How an arena's region is split between blocks and bitmap storage
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArenaGeometry {
    /// Number of blocks that can be handed out
    pub num_blocks: usize,

    /// Number of bytes covered by blocks, from the start of the region
    pub usable_capacity: usize,

    /// Offset of the bitmap storage from the start of the region
    pub bitmap_offset: usize,

    /// Word counts of the free bitmap
    pub bitmap: BitmapLayout,
}

impl ArenaGeometry {
    /// Compute the geometry of an arena of `block_size`-byte blocks
    ///
    /// The block size must be a power of 2, no larger than half an arena.
    pub fn for_block_size(block_size: usize) -> Self {
        assert!(block_size.is_power_of_two(), "Block size must be a power of 2");
        assert!(block_size <= ARENA_SIZE / 2,
                "Block size is too large for an arena");

        // Size the bitmap as if the whole region was made of blocks, then give
        // up the blocks which overlap with the bitmap storage.
        let bitmap = BitmapLayout::for_blocks(ARENA_SIZE / block_size);
        let bitmap_offset = ARENA_SIZE - bitmap.num_bytes();
        let num_blocks = bitmap_offset / block_size;
        Self {
            num_blocks,
            usable_capacity: num_blocks * block_size,
            bitmap_offset,
            bitmap,
        }
    }
}


/// A region of OS memory serving blocks of one size
pub struct Arena<P: Policy> {
    /// Start of the region (and of the first block)
    base: NonNull<u8>,

    /// Bitshift-based representation of the block size
    block_shift: u8,

    /// End of the block area, relative to `base`
    usable_capacity: usize,

    /// Offset of the next never-allocated block, relative to `base`
    bump_offset: CachePadded<P::Counter>,

    /// Blocks which were freed and not reclaimed yet
    free_blocks: FreeBitmap<P>,

    /// Backing memory, including the free bitmap's storage
    _mapping: Mapping,
}

// The raw pointers only point into the arena's own mapping, so the arena can
// go wherever its mapping goes, and be shared whenever its words can be.
unsafe impl<P: Policy> Send for Arena<P> {}
unsafe impl<P: Policy> Sync for Arena<P>
where
    P::Word: Sync,
    P::Counter: Sync,
{}

impl<P: Policy> Arena<P> {
    /// Map a new arena for blocks of `block_size` bytes
    ///
    /// The block size must be a power of 2, no larger than half an arena.
    /// Other block sizes are rejected with a panic, before anything is mapped.
    pub fn new(block_size: usize) -> Result<Self, AllocError> {
        let geometry = ArenaGeometry::for_block_size(block_size);
        let mapping = Mapping::new(ARENA_SIZE)?;
        let base = mapping.start();
        debug_assert!(mapping.len() >= ARENA_SIZE);
        debug_assert_eq!(geometry.bitmap_offset % mem::align_of::<P::Word>(), 0,
                         "Bitmap storage would be misaligned");

        // This is safe because the bitmap storage lies at the end of the
        // freshly mapped (thus zeroed) region, which outlives the bitmap, and
        // never overlaps with a block.
        let free_blocks = unsafe {
            let words = base.as_ptr().add(geometry.bitmap_offset).cast::<P::Word>();
            FreeBitmap::from_raw(NonNull::new_unchecked(words),
                                 geometry.bitmap,
                                 geometry.num_blocks)
        };

        debug!(policy = P::NAME,
               block_size,
               num_blocks = geometry.num_blocks,
               usable_capacity = geometry.usable_capacity,
               "mapped new arena");
        Ok(Self {
            base,
            block_shift: block_size.trailing_zeros() as u8,
            usable_capacity: geometry.usable_capacity,
            bump_offset: CachePadded::new(P::Counter::new(0)),
            free_blocks,
            _mapping: mapping,
        })
    }

    /// Size of the blocks served by this arena (in bytes)
    pub fn block_size(&self) -> usize {
        1 << (self.block_shift as usize)
    }

    /// Number of blocks in this arena
    pub fn num_blocks(&self) -> usize {
        self.free_blocks.num_blocks()
    }

    /// Number of bytes covered by blocks
    pub fn usable_capacity(&self) -> usize {
        self.usable_capacity
    }

    /// Allocate one block, or return `None` if the arena is full
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let block_size = self.block_size();
        let mut offset = self.bump_offset.load(Ordering::Relaxed);
        while offset < self.usable_capacity {
            match self.bump_offset.compare_exchange_weak(offset,
                                                         offset + block_size,
                                                         Ordering::Acquire,
                                                         Ordering::Relaxed) {
                Ok(_) => return Some(self.block_at(offset)),
                Err(observed) => offset = observed,
            }
        }
        self.free_blocks
            .claim()
            .map(|block_idx| self.block_at(block_idx << self.block_shift))
    }

    /// Return a block to the arena
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `allocate()` on this arena, and must
    /// not be used (nor deallocated again) after this call.
    pub unsafe fn deallocate(&self, block: NonNull<u8>) {
        debug_assert!(self.owns(block.as_ptr()),
                      "Deallocated block does not belong to this arena");
        let offset = block.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert_eq!(offset % self.block_size(), 0,
                         "Deallocated pointer is not on a block boundary");
        self.free_blocks.release(offset >> self.block_shift);
    }

    /// Truth that `ptr` points into this arena's blocks
    ///
    /// Pointers below the arena's base wrap around to huge offsets, so a
    /// single unsigned comparison rejects them.
    pub fn owns(&self, ptr: *const u8) -> bool {
        (ptr as usize).wrapping_sub(self.base.as_ptr() as usize) < self.usable_capacity
    }

    /// Truth that no block can currently be allocated from this arena
    ///
    /// When other threads use the arena concurrently, this is only a snapshot
    /// which may be outdated by the time it is returned.
    pub fn is_full(&self) -> bool {
        self.bump_offset.load(Ordering::Relaxed) >= self.usable_capacity
            && !self.free_blocks.has_free()
    }

    /// Block at a given offset from the start of the arena
    fn block_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.usable_capacity, "Block offset is out of range");
        // This is safe because the offset is within the arena's mapping
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

impl<P: Policy> fmt::Debug for Arena<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
         .field("policy", &P::NAME)
         .field("base", &self.base)
         .field("block_size", &self.block_size())
         .field("num_blocks", &self.num_blocks())
         .field("bump_offset", &self.bump_offset.load(Ordering::Relaxed))
         .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Local, Shared};

    use rand::seq::SliceRandom;

    use std::{collections::HashSet, iter, sync::Arc};

    // Largest block size, for which arenas are quick to fill
    const LARGE_BLOCK: usize = 4 * 1024 * 1024;

    #[test]
    fn geometry() {
        for shift in 3..=22 {
            let block_size = 1 << shift;
            let geometry = ArenaGeometry::for_block_size(block_size);
            assert_eq!(geometry.usable_capacity, geometry.num_blocks * block_size);
            assert!(geometry.usable_capacity <= geometry.bitmap_offset);
            assert!(geometry.bitmap_offset - geometry.usable_capacity < block_size);
            assert_eq!(geometry.bitmap_offset + geometry.bitmap.num_bytes(), ARENA_SIZE);
            assert!(geometry.num_blocks <= geometry.bitmap.l2_words * 64);
        }

        let geometry = ArenaGeometry::for_block_size(16);
        assert_eq!(geometry.bitmap, BitmapLayout { l2_words: 65536,
                                                   l1_bits: 1024,
                                                   l1_words: 16 });
        assert_eq!(geometry.num_blocks, (ARENA_SIZE - (65536 + 16) * 8) / 16);

        let geometry = ArenaGeometry::for_block_size(LARGE_BLOCK);
        assert_eq!(geometry.num_blocks, 15);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_block_size() {
        let _ = Arena::<Local>::new(24);
    }

    #[test]
    #[should_panic]
    fn zero_block_size() {
        let _ = Arena::<Local>::new(0);
    }

    #[test]
    #[should_panic]
    fn block_size_too_large() {
        ArenaGeometry::for_block_size(ARENA_SIZE);
    }

    #[test]
    fn bump_allocation() {
        let arena = Arena::<Local>::new(64).unwrap();
        assert_eq!(arena.block_size(), 64);
        let first = arena.allocate().unwrap();
        assert_eq!(first.as_ptr() as usize % 64, 0);
        for idx in 1..1000 {
            let block = arena.allocate().unwrap();
            assert_eq!(block.as_ptr() as usize - first.as_ptr() as usize, idx * 64);
            unsafe { block.as_ptr().write_bytes(0xAB, 64) };
        }
        assert!(!arena.is_full());
    }

    #[test]
    fn ownership() {
        let arena = Arena::<Local>::new(LARGE_BLOCK).unwrap();
        let base = arena.allocate().unwrap().as_ptr();
        assert!(arena.owns(base));
        assert!(arena.owns(base.wrapping_add(1)));
        assert!(arena.owns(base.wrapping_add(arena.usable_capacity() - 1)));
        assert!(!arena.owns(base.wrapping_add(arena.usable_capacity())));
        assert!(!arena.owns(base.wrapping_add(ARENA_SIZE - 1)));
        assert!(!arena.owns(base.wrapping_sub(1)));
        assert!(!arena.owns(std::ptr::null()));

        let other = Arena::<Local>::new(LARGE_BLOCK).unwrap();
        let foreign = other.allocate().unwrap().as_ptr();
        assert!(!arena.owns(foreign));
        assert!(other.owns(foreign));
    }

    #[test]
    fn fill_free_refill() {
        let arena = Arena::<Local>::new(LARGE_BLOCK).unwrap();
        let mut blocks = iter::from_fn(|| arena.allocate()).collect::<Vec<_>>();
        assert_eq!(blocks.len(), arena.num_blocks());
        assert!(arena.is_full());

        // Recycle a few blocks through the bitmap until the arena fills again
        for block in blocks.drain(3..6) {
            unsafe { arena.deallocate(block) };
        }
        assert!(!arena.is_full());
        blocks.extend(iter::from_fn(|| arena.allocate()));
        assert_eq!(blocks.len(), arena.num_blocks());
        assert!(arena.is_full());

        // Freeing a single block makes the arena usable again
        let freed = blocks.pop().unwrap();
        unsafe { arena.deallocate(freed) };
        assert!(!arena.is_full());
        assert_eq!(arena.allocate(), Some(freed));
        assert!(arena.is_full());
        assert_eq!(arena.allocate(), None);
    }

    #[test]
    fn recycle_in_any_order() {
        let arena = Arena::<Local>::new(1024 * 1024).unwrap();
        let mut blocks = iter::from_fn(|| arena.allocate()).collect::<Vec<_>>();
        assert_eq!(blocks.len(), arena.num_blocks());

        blocks.shuffle(&mut rand::thread_rng());
        let expected = blocks.iter().copied().collect::<HashSet<_>>();
        for block in blocks {
            unsafe { arena.deallocate(block) };
        }

        let recycled = iter::from_fn(|| arena.allocate()).collect::<HashSet<_>>();
        assert_eq!(recycled, expected);
        assert!(arena.is_full());
    }

    #[test]
    fn cross_thread_recycling() {
        let arena = Arc::new(Arena::<Shared>::new(1024 * 1024).unwrap());
        let blocks = iter::from_fn(|| arena.allocate())
                         .map(|block| block.as_ptr() as usize)
                         .collect::<Vec<_>>();
        let num_blocks = blocks.len();
        assert_eq!(num_blocks, arena.num_blocks());

        let freer = arena.clone();
        let claimer = arena.clone();
        testbench::concurrent_test_2(
            move || {
                for (idx, &addr) in blocks.iter().enumerate() {
                    unsafe {
                        (addr as *mut u64).write(idx as u64 + 1);
                        freer.deallocate(NonNull::new_unchecked(addr as *mut u8));
                    }
                }
            },
            move || {
                // Every write made before a block was freed must be visible
                // to the thread which claims it.
                let mut seen = HashSet::new();
                while seen.len() < num_blocks {
                    if let Some(block) = claimer.allocate() {
                        let tag = unsafe { block.cast::<u64>().as_ptr().read() };
                        assert!(tag >= 1 && tag <= num_blocks as u64);
                        assert!(seen.insert(tag), "block {} claimed twice", tag);
                    }
                }
            },
        );
        assert!(arena.is_full());
    }
}
