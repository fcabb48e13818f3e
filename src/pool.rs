//! Growable sets of arenas serving one block size

use crate::{
    arena::Arena,
    builder::PoolBuilder,
    error::AllocError,
    os::OsBox,
    policy::{Policy, Slot},
};

use crossbeam_utils::CachePadded;

use tracing::{debug, warn};

use std::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};


/// Maximal number of arenas in a pool
pub const MAX_ARENAS: usize = 16;


/// A set of up to `MAX_ARENAS` arenas serving blocks of one size
///
/// Arenas are created on demand, when all existing arenas are full, and are
/// only released when the pool itself is dropped.
pub struct ArenaPool<P: Policy> {
    /// Arena slots, populated in creation order
    ///
    /// A slot may be observed as null while the arena is being created, and a
    /// slot whose creation failed may stay null forever.
    arenas: [AtomicPtr<Arena<P>>; MAX_ARENAS],

    /// Number of claimed arena slots
    num_arenas: CachePadded<P::Counter>,

    /// Arena which served the last allocation
    current_arena: CachePadded<P::Counter>,

    /// Size of the blocks served by this pool
    block_size: usize,

    /// Maximal number of arenas that this pool may create
    max_arenas: usize,

    /// The pool owns the arenas behind its slot pointers
    _arenas: PhantomData<Arena<P>>,
}

impl<P: Policy> ArenaPool<P> {
    /// Start building a pool
    ///
    /// See the `PoolBuilder` documentation for the available settings.
    pub const fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create an empty pool of `block_size`-byte blocks, with the default
    /// arena limit
    pub fn new(block_size: usize) -> Self {
        Self::builder().block_size(block_size).build()
    }

    /// Pool constructor proper, without parameter checking
    ///
    /// Parameters are assumed to have been validated by `PoolBuilder`.
    pub(crate) fn new_unchecked(block_size: usize, max_arenas: usize) -> Self {
        debug_assert!(max_arenas >= 1 && max_arenas <= MAX_ARENAS);
        Self {
            arenas: Default::default(),
            num_arenas: CachePadded::new(P::Counter::new(0)),
            current_arena: CachePadded::new(P::Counter::new(0)),
            block_size,
            max_arenas,
            _arenas: PhantomData,
        }
    }

    /// Size of the blocks served by this pool (in bytes)
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of arena slots claimed so far
    pub fn num_arenas(&self) -> usize {
        self.num_arenas.load(Ordering::Acquire)
    }

    /// Maximal number of arenas that this pool may create
    pub fn max_arenas(&self) -> usize {
        self.max_arenas
    }

    /// Truth that `ptr` points into one of this pool's arenas
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.find_owner(ptr).is_some()
    }

    /// Allocate one block, creating a new arena if all existing ones are full
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let block_size = self.block_size;
        self.allocate_with(|| Arena::new(block_size).and_then(OsBox::new))
    }

    /// Allocation proper, with a configurable arena constructor
    fn allocate_with(
        &self,
        mut new_arena: impl FnMut() -> Result<OsBox<Arena<P>>, AllocError>
    ) -> Result<NonNull<u8>, AllocError> {
        loop {
            let num_arenas = self.num_arenas.load(Ordering::Acquire);
            if let Some(block) = self.allocate_from_existing(num_arenas) {
                return Ok(block);
            }

            if num_arenas >= self.max_arenas {
                warn!(policy = P::NAME,
                      block_size = self.block_size,
                      arenas = num_arenas,
                      "arena pool is exhausted");
                return Err(AllocError::PoolExhausted {
                    block_size: self.block_size,
                    arenas: num_arenas,
                });
            }

            // Claim the next slot. Losing this race means that another thread
            // just grew the pool, so we go back to trying existing arenas.
            if self.num_arenas
                   .compare_exchange(num_arenas,
                                     num_arenas + 1,
                                     Ordering::AcqRel,
                                     Ordering::Acquire)
                   .is_err()
            {
                continue;
            }

            let arena = match new_arena() {
                Ok(arena) => OsBox::into_raw(arena),
                Err(error) => {
                    self.release_slot(num_arenas);
                    return Err(error);
                }
            };
            self.arenas[num_arenas].store(arena.as_ptr(), Ordering::Release);
            self.current_arena.store(num_arenas, Ordering::Release);
            debug!(policy = P::NAME,
                   block_size = self.block_size,
                   slot = num_arenas,
                   "arena pool grew");

            // Other threads may drain the fresh arena before we get to it, in
            // which case we just go for another round.
            //
            // This is safe because published arenas live as long as the pool
            if let Some(block) = unsafe { arena.as_ref() }.allocate() {
                return Ok(block);
            }
        }
    }

    /// Return a block to the arena that it was allocated from
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `allocate()` on this pool, and must
    /// not be used (nor deallocated again) after this call. This is not
    /// checked in release builds.
    pub unsafe fn deallocate(&self, block: NonNull<u8>) {
        match self.find_owner(block.as_ptr()) {
            // This is safe per the function contract
            Some(arena) => unsafe { arena.deallocate(block) },
            None => debug_assert!(false, "Deallocated block does not belong to this pool"),
        }
    }

    /// Try the last successful arena, then every other existing arena
    fn allocate_from_existing(&self, num_arenas: usize) -> Option<NonNull<u8>> {
        let current = self.current_arena.load(Ordering::Acquire);
        if let Some(block) = self.arena(current).and_then(Arena::allocate) {
            return Some(block);
        }
        for idx in (0..num_arenas).filter(|&idx| idx != current) {
            if let Some(block) = self.arena(idx).and_then(Arena::allocate) {
                self.current_arena.store(idx, Ordering::Release);
                return Some(block);
            }
        }
        None
    }

    /// Give back a claimed arena slot after failing to create its arena
    ///
    /// If another thread has claimed a later slot in the meantime, the count
    /// cannot be rolled back, and this slot is left permanently empty.
    fn release_slot(&self, slot: usize) {
        let rolled_back = self.num_arenas
                              .compare_exchange(slot + 1,
                                                slot,
                                                Ordering::AcqRel,
                                                Ordering::Relaxed)
                              .is_ok();
        warn!(policy = P::NAME,
              block_size = self.block_size,
              slot,
              rolled_back,
              "failed to grow arena pool");
    }

    /// Arena in a given slot, if it exists and has been published
    fn arena(&self, idx: usize) -> Option<&Arena<P>> {
        let arena = self.arenas.get(idx)?.load(Ordering::Acquire);
        // This is safe because published arenas live as long as the pool
        unsafe { arena.as_ref() }
    }

    /// Arena which owns a given pointer, if any
    fn find_owner(&self, ptr: *const u8) -> Option<&Arena<P>> {
        let num_arenas = self.num_arenas.load(Ordering::Acquire);
        (0..num_arenas.min(MAX_ARENAS))
            .filter_map(|idx| self.arena(idx))
            .find(|arena| arena.owns(ptr))
    }
}

impl<P: Policy> Drop for ArenaPool<P> {
    fn drop(&mut self) {
        for slot in self.arenas.iter_mut() {
            let arena = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if let Some(arena) = NonNull::new(arena) {
                // This is safe because slots only hold pointers obtained from
                // OsBox::into_raw(), and we just emptied this one.
                std::mem::drop(unsafe { OsBox::from_raw(arena) });
            }
        }
    }
}

impl<P: Policy> fmt::Debug for ArenaPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaPool")
         .field("policy", &P::NAME)
         .field("block_size", &self.block_size)
         .field("num_arenas", &self.num_arenas())
         .field("max_arenas", &self.max_arenas)
         .finish()
    }
}
