//! Operating system memory mappings
//!
//! This module is the only place where raw OS memory gets reinterpreted as
//! Rust values. Everything above it manipulates either a `Mapping` (an owned
//! region of zero-filled memory) or an `OsBox` (an owned value placed inside
//! its own mapping), and never has to reason about where the memory came from.

use crate::error::AllocError;

use tracing::{trace, warn};

use std::{
    fmt,
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};


/// Owned, readable and writable, zero-filled region of OS memory
///
/// The region is released back to the operating system when this is dropped.
pub struct Mapping(region::Allocation);

impl Mapping {
    /// Reserve and commit `size` bytes (rounded up to the page size)
    pub fn new(size: usize) -> Result<Self, AllocError> {
        region::alloc(size, region::Protection::READ_WRITE)
            .map(Mapping)
            .map_err(|source| {
                warn!(size, error = %source, "operating system refused to map memory");
                AllocError::Map { size, source }
            })
    }

    /// Start of the mapped region, aligned to at least the page size
    pub fn start(&self) -> NonNull<u8> {
        // Mappings are never null, as region reports mapping failures
        NonNull::new(self.0.as_ptr::<u8>() as *mut u8)
            .expect("Operating system returned a null mapping")
    }

    /// Length of the mapped region in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
         .field("start", &self.start())
         .field("len", &self.len())
         .finish()
    }
}


/// Alignment that every mapping is guaranteed to have
pub fn page_size() -> usize {
    region::page::size()
}


/// A value together with the mapping that holds it
#[repr(C)]
struct Placed<T> {
    value: T,
    mapping: ManuallyDrop<Mapping>,
}

/// Owning pointer to a value that lives in its own OS mapping
///
/// This is what `Box` would be if it did not go through the global allocator,
/// which the allocator's own bookkeeping must not depend on.
pub struct OsBox<T> {
    placed: NonNull<Placed<T>>,
}

impl<T> OsBox<T> {
    /// Move `value` into a fresh OS mapping
    pub fn new(value: T) -> Result<Self, AllocError> {
        debug_assert!(mem::align_of::<Placed<T>>() <= page_size(),
                      "Over-aligned values cannot be placed in a mapping");
        let mapping = Mapping::new(mem::size_of::<Placed<T>>())?;
        let placed = mapping.start().cast::<Placed<T>>();

        // This is safe because the mapping is large enough and suitably
        // aligned for a Placed<T>, and nothing else refers to it yet.
        unsafe {
            placed.as_ptr().write(Placed {
                value,
                mapping: ManuallyDrop::new(mapping),
            });
        }
        Ok(Self { placed })
    }

    /// Give up ownership, returning a pointer to the value
    ///
    /// Ownership can be recovered later on with `OsBox::from_raw()`.
    pub fn into_raw(this: Self) -> NonNull<T> {
        let this = ManuallyDrop::new(this);
        // `value` is the first field of a repr(C) struct
        this.placed.cast::<T>()
    }

    /// Recover ownership of a value released by `OsBox::into_raw()`
    ///
    /// # Safety
    ///
    /// `value` must come from `OsBox::<T>::into_raw()`, and ownership must be
    /// recovered at most once.
    pub unsafe fn from_raw(value: NonNull<T>) -> Self {
        Self { placed: value.cast::<Placed<T>>() }
    }
}

impl<T> Deref for OsBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // This is safe because we own the placed value
        unsafe { &self.placed.as_ref().value }
    }
}

impl<T> DerefMut for OsBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // This is safe because we own the placed value
        unsafe { &mut self.placed.as_mut().value }
    }
}

impl<T> Drop for OsBox<T> {
    fn drop(&mut self) {
        // Move everything out of the mapping before unmapping it. This is safe
        // because we own the placed value and never touch it again.
        let Placed { value, mapping } = unsafe { ptr::read(self.placed.as_ptr()) };
        mem::drop(value);
        mem::drop(ManuallyDrop::into_inner(mapping));
    }
}

impl<T: fmt::Debug> fmt::Debug for OsBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}


/// Offset of the mapping handle that follows a large block of `size` bytes
fn large_handle_offset(size: usize) -> Option<usize> {
    let align = mem::align_of::<Mapping>();
    size.checked_add(align - 1).map(|padded| padded & !(align - 1))
}

/// Map a dedicated region for one block of `size` bytes
///
/// The returned block is page-aligned and zero-filled. The mapping handle is
/// stored right after the block, so that `unmap_large()` only needs the block
/// pointer and size to release everything.
pub fn map_large(size: usize) -> Result<NonNull<u8>, AllocError> {
    let handle_offset = large_handle_offset(size)
        .filter(|offset| offset.checked_add(mem::size_of::<Mapping>()).is_some())
        .ok_or(AllocError::CapacityOverflow { count: size, elem_size: 1 })?;
    let mapping = Mapping::new(handle_offset + mem::size_of::<Mapping>())?;
    let start = mapping.start();

    // This is safe because the handle slot is in bounds of the mapping,
    // suitably aligned, and not part of the block handed out to the caller.
    unsafe {
        start.as_ptr()
             .add(handle_offset)
             .cast::<Mapping>()
             .write(mapping);
    }
    trace!(size, block = ?start, "mapped oversized block");
    Ok(start)
}

/// Release a block obtained from `map_large()`
///
/// # Safety
///
/// `block` must have been returned by `map_large(size)` with this exact `size`,
/// and must not be used after this call.
pub unsafe fn unmap_large(block: NonNull<u8>, size: usize) {
    let handle_offset = large_handle_offset(size)
        .expect("Large blocks are mapped with a valid handle offset");
    // This is safe per the function contract. The handle is moved out of the
    // mapping before being dropped, which unmaps the block and the handle slot.
    let mapping = unsafe {
        ptr::read(block.as_ptr().add(handle_offset).cast::<Mapping>())
    };
    debug_assert_eq!(mapping.start(), block,
                     "Large block was released with a mismatched size");
    trace!(size, block = ?block, "unmapping oversized block");
    mem::drop(mapping);
}
