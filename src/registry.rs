//! Per-size-class sets of arena pools

use crate::{
    error::AllocError,
    os,
    policy::{Local, Policy, Shared},
    pool::ArenaPool,
    size_class::{self, NUM_SIZE_CLASSES, UNCLASSED},
};

use once_cell::sync::OnceCell;

use std::{
    fmt,
    mem::ManuallyDrop,
    ptr::NonNull,
};


/// One arena pool per size class, plus direct OS mappings for larger requests
///
/// This is the allocation context behind `Allocator`, which uses a per-thread
/// `Registry<Local>` or the process-wide `Registry<Shared>`. Registries can
/// also be created explicitly, in which case every block they hand out is
/// unmapped when they are dropped.
pub struct Registry<P: Policy> {
    pools: [ArenaPool<P>; NUM_SIZE_CLASSES],
}

impl<P: Policy> Registry<P> {
    /// Set up an empty registry
    ///
    /// No memory is mapped until the first allocation of each size class.
    pub fn new() -> Self {
        Self {
            pools: std::array::from_fn(|idx| {
                ArenaPool::new(size_class::index_to_size(idx))
            }),
        }
    }

    /// Arena pool of a given size class
    ///
    /// Returns `None` if `size_class` is not one of the values returned by
    /// `round_to_size_class()`.
    pub fn pool(&self, size_class: usize) -> Option<&ArenaPool<P>> {
        if size_class::round_to_size_class(size_class) != size_class
           || size_class == UNCLASSED
        {
            return None;
        }
        self.pools.get(size_class::size_to_index(size_class))
    }

    /// Allocate a block of at least `bytes` bytes
    ///
    /// Requests that are too large for a size class get their own mapping.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        match size_class::round_to_size_class(bytes) {
            UNCLASSED => os::map_large(bytes),
            size_class => self.pools[size_class::size_to_index(size_class)].allocate(),
        }
    }

    /// Deallocate a block of `bytes` bytes
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `allocate(bytes)` on this registry,
    /// with the same `bytes`, and must not be used after this call.
    pub unsafe fn deallocate(&self, block: NonNull<u8>, bytes: usize) {
        match size_class::round_to_size_class(bytes) {
            // Both are safe per the function contract
            UNCLASSED => unsafe { os::unmap_large(block, bytes) },
            size_class => unsafe {
                self.pools[size_class::size_to_index(size_class)].deallocate(block)
            },
        }
    }
}

impl<P: Policy> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Policy> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.pools.iter().filter(|pool| pool.num_arenas() > 0);
        f.debug_struct("Registry")
         .field("policy", &P::NAME)
         .field("active_pools", &active.collect::<Vec<_>>())
         .finish()
    }
}


thread_local! {
    // Never dropped, so that blocks remain valid until the thread is gone and
    // late deallocations from other thread-local destructors stay harmless.
    static LOCAL_REGISTRY: ManuallyDrop<Registry<Local>> =
        ManuallyDrop::new(Registry::new());
}

/// Run `f` on the calling thread's registry
pub(crate) fn with_local<R>(f: impl FnOnce(&Registry<Local>) -> R) -> R {
    LOCAL_REGISTRY.with(|registry| f(registry))
}

/// Process-wide registry
pub(crate) fn shared() -> &'static Registry<Shared> {
    static SHARED_REGISTRY: OnceCell<Registry<Shared>> = OnceCell::new();
    SHARED_REGISTRY.get_or_init(Registry::new)
}
