//! Owned single values in allocator memory

use crate::{
    allocator::Allocator,
    error::AllocError,
    policy::{Local, Policy, Shared},
};

use std::{
    fmt,
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};


/// Owning pointer to a value stored in a size-class block
///
/// This is the `Box` of this crate: the value is dropped and its block is
/// returned to the registry it came from when the `PoolBox` goes out of scope.
/// A `PoolBox<T, Local>` cannot leave the thread that created it.
pub struct PoolBox<T, P: Policy = Local> {
    ptr: NonNull<T>,
    _owned: PhantomData<(T, P)>,
}

impl<T, P: Policy> PoolBox<T, P> {
    /// Move `value` into a freshly allocated block
    pub fn new(value: T) -> Result<Self, AllocError> {
        let ptr = Allocator::<T, P>::new().allocate(1)?;
        // This is safe because the block is fresh, large and aligned enough
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, _owned: PhantomData })
    }

    /// Move the value back out, releasing its block
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        // This is safe because we own the value and block, and `this` will not
        // be dropped, so neither is touched again.
        unsafe {
            let value = ptr::read(this.ptr.as_ptr());
            Allocator::<T, P>::new().deallocate(this.ptr.as_ptr(), 1);
            value
        }
    }

    /// Address of the boxed value
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }
}

impl<T, P: Policy> Deref for PoolBox<T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // This is safe because we own an initialized value
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, P: Policy> DerefMut for PoolBox<T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // This is safe because we own an initialized value
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, P: Policy> Drop for PoolBox<T, P> {
    fn drop(&mut self) {
        // This is safe because we own the value and its block
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            Allocator::<T, P>::new().deallocate(self.ptr.as_ptr(), 1);
        }
    }
}

impl<T: fmt::Debug, P: Policy> fmt::Debug for PoolBox<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// Shared blocks may be released from any thread, so these behave like Box
unsafe impl<T: Send> Send for PoolBox<T, Shared> {}
unsafe impl<T: Sync> Sync for PoolBox<T, Shared> {}
