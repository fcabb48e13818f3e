//! This crate provides a Size-Class Arena Allocator, which you can use for
//! your dynamic memory allocation needs when lots of small objects are created
//! and destroyed and the system memory allocator is not fast enough.
//!
//! Allocation and deallocation of pooled sizes are constant-time in the common
//! case, take no lock, and only call into the operating system when a new
//! arena must be mapped. The allocator never returns memory to the operating
//! system while it is in use.
//!
//! # Size-class allocation primer
//!
//! Every allocation request is rounded up to a **size class**, the smallest
//! power of two that can hold it, from 8 bytes (`MIN_SIZE_CLASS`) to 4 MiB
//! (`MAX_SIZE_CLASS`). Requests above that bypass the size class machinery
//! and get their own operating system mapping.
//!
//! Each size class is served by an **arena pool**, a set of up to 16
//! (`MAX_ARENAS`) **arenas** which are created on demand. An arena is a 64 MiB
//! (`ARENA_SIZE`) region of virtual memory divided into equal **blocks**, and
//! allocates in two phases:
//!
//! - While some part of the arena has never been used, allocation just bumps
//!   a cursor to the next block, and never looks at freed blocks.
//! - Once the cursor has reached the end of the arena, allocation recycles
//!   freed blocks, which are tracked by a two-level **bitmap** stored at the
//!   end of the arena. Each bit of the lower level tracks one block, and each
//!   bit of the upper level summarizes 64 words of the lower level, so that
//!   finding a free block in an arena of millions never takes more than a few
//!   hundred memory accesses.
//!
//! Deallocation finds the arena that owns a block by address, and sets the
//! corresponding bit of its bitmap.
//!
//! Blocks are aligned to their size class, up to the OS page size.
//!
//! # Synchronization policies
//!
//! Allocator state lives in a **registry** (one arena pool per size class),
//! which comes in two flavors:
//!
//! - With the `Local` policy, each thread has its own registry, and the
//!   bookkeeping uses plain `Cell`s. Memory must be deallocated by the thread
//!   that allocated it.
//! - With the `Shared` policy, there is one process-wide registry, and the
//!   bookkeeping uses atomics. Memory may be deallocated by any thread.
//!
//! # Safety
//!
//! Like any allocator, this one cannot check how you use it, and the
//! following are **undefined behavior**:
//!
//! - Deallocating a pointer that was not allocated by an allocator of the same
//!   policy, or with a different element count or element type.
//! - Deallocating the same allocation twice (this is caught by an assertion in
//!   debug builds, but not in release builds).
//! - Using an allocation after it has been deallocated.
//! - Deallocating `Local` memory on another thread than the one that
//!   allocated it.
//!
//! # Example
//!
//! ```
//! use arenalloc::{Allocator, PoolBox, Shared};
//!
//! // Arrays of values, from the calling thread's registry
//! let alloc = Allocator::<u64>::new();
//! let ptr = alloc.allocate(16)?;
//! unsafe {
//!     for i in 0..16 {
//!         ptr.as_ptr().add(i).write(i as u64);
//!     }
//!     alloc.deallocate(ptr.as_ptr(), 16);
//! }
//!
//! // Single values, from the process-wide registry
//! let boxed = PoolBox::<_, Shared>::new(String::from("hello"))?;
//! let handle = std::thread::spawn(move || boxed.len());
//! assert_eq!(handle.join().unwrap(), 5);
//! # Ok::<(), arenalloc::AllocError>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod arena;
mod bitmap;
mod boxed;
mod builder;
mod error;
mod os;
mod policy;
mod pool;
mod registry;
mod size_class;

// Re-export the public API at the crate root
pub use crate::{
    allocator::Allocator,
    arena::{Arena, ArenaGeometry, ARENA_SIZE},
    bitmap::{BitmapLayout, L2_WORDS_PER_L1_BIT},
    boxed::PoolBox,
    builder::PoolBuilder,
    error::AllocError,
    policy::{Local, Policy, Shared, Slot},
    pool::{ArenaPool, MAX_ARENAS},
    registry::Registry,
    size_class::{
        round_to_size_class,
        size_to_index,
        MAX_SIZE_CLASS,
        MIN_SIZE_CLASS,
        NUM_SIZE_CLASSES,
        UNCLASSED,
    },
};


/// Small utility to divide two integers, rounding the result up
pub(crate) fn div_round_up(x: usize, y: usize) -> usize {
    // Check interface preconditions in debug builds
    debug_assert!(y != 0, "Attempted to divide by zero");

    // Return rounded division result
    (x / y) + (x % y != 0) as usize
}



// TODO: Benchmark against the system allocator at various size classes, and
//       show a graph on README
