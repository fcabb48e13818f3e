//! Typed allocation front-end

use crate::{
    error::AllocError,
    os,
    policy::{Local, Policy},
};

use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::NonNull,
};


/// Stateless handle that allocates arrays of `T` from a registry
///
/// With the default `Local` policy, memory comes from the calling thread's own
/// registry and must be deallocated on that same thread. With the `Shared`
/// policy, it comes from a process-wide registry and may be deallocated from
/// any thread.
///
/// All handles with the same policy are interchangeable, whatever their
/// element type: memory allocated through one can be deallocated through any
/// other (after `rebind()`-ing to the right element type).
///
/// There is no `GlobalAlloc` implementation. The allocator emits `tracing`
/// events and lazily builds its registries through `thread_local!` and
/// `OnceCell`, all of which may allocate, so using it as the global allocator
/// would make it re-enter itself. Standard containers cannot be given a custom
/// allocator on stable Rust either, so `PoolBox` and raw arrays are the
/// supported ways to use it.
pub struct Allocator<T, P: Policy = Local> {
    _marker: PhantomData<fn() -> (T, P)>,
}

impl<T, P: Policy> Allocator<T, P> {
    /// Create an allocator handle
    pub const fn new() -> Self {
        Self { _marker: PhantomData }
    }

    /// Allocator handle for another element type, with the same policy
    pub fn rebind<U>(self) -> Allocator<U, P> {
        Allocator::new()
    }

    /// Allocate uninitialized storage for `n` values of type `T`
    ///
    /// Empty requests (`n == 0` or zero-sized `T`) do not allocate, and yield
    /// a dangling, well-aligned pointer.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let bytes = match Self::request_bytes(n)? {
            0 => return Ok(NonNull::dangling()),
            bytes => bytes,
        };
        let page_size = os::page_size();
        if mem::align_of::<T>() > page_size {
            return Err(AllocError::UnsupportedAlignment {
                align: mem::align_of::<T>(),
                page_size,
            });
        }

        // Power-of-two blocks are aligned to their size up to the page size,
        // and size_of::<T>() is a multiple of align_of::<T>(), so the block is
        // suitably aligned for T.
        P::with_registry(|registry| registry.allocate(bytes)).map(NonNull::cast)
    }

    /// Deallocate storage for `n` values of type `T`
    ///
    /// Null pointers and empty requests are ignored.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by `allocate(n)` on an
    /// allocator with the same policy and element type, with the same `n`. It
    /// must not have been deallocated already, and must not be used after this
    /// call. With the `Local` policy, it must also have been allocated by the
    /// calling thread.
    pub unsafe fn deallocate(&self, ptr: *mut T, n: usize) {
        let bytes = match Self::request_bytes(n) {
            Ok(bytes) if bytes != 0 => bytes,
            _ => return,
        };
        if let Some(block) = NonNull::new(ptr) {
            // This is safe per the function contract
            P::with_registry(|registry| unsafe {
                registry.deallocate(block.cast(), bytes)
            })
        }
    }

    /// Number of bytes needed to store `n` values of type `T`
    fn request_bytes(n: usize) -> Result<usize, AllocError> {
        n.checked_mul(mem::size_of::<T>())
         .ok_or(AllocError::CapacityOverflow { count: n, elem_size: mem::size_of::<T>() })
    }
}

// Manual implementations, as derives would put bounds on T and P

impl<T, P: Policy> Clone for Allocator<T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, P: Policy> Copy for Allocator<T, P> {}

impl<T, P: Policy> Default for Allocator<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P: Policy> fmt::Debug for Allocator<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
         .field("policy", &P::NAME)
         .field("element_size", &mem::size_of::<T>())
         .finish()
    }
}

/// Allocators of the same policy share their registry, so any two of them
/// compare equal.
impl<T, U, P: Policy> PartialEq<Allocator<U, P>> for Allocator<T, P> {
    fn eq(&self, _other: &Allocator<U, P>) -> bool {
        true
    }
}

impl<T, P: Policy> Eq for Allocator<T, P> {}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::Shared,
        size_class::MAX_SIZE_CLASS,
    };

    use rand::seq::SliceRandom;

    use std::{ptr, thread};

    fn check_aligned<T>(ptr: NonNull<T>) {
        assert_eq!(ptr.as_ptr() as usize % mem::align_of::<T>(), 0);
    }

    #[test]
    fn basic_allocation() {
        let alloc = Allocator::<u64>::new();
        let ptr = alloc.allocate(10).unwrap();
        check_aligned(ptr);
        unsafe {
            for i in 0..10 {
                ptr.as_ptr().add(i).write(i as u64 * 3);
            }
            assert_eq!((0..10).map(|i| *ptr.as_ptr().add(i)).sum::<u64>(), 135);
            alloc.deallocate(ptr.as_ptr(), 10);
        }
    }

    #[test]
    fn empty_requests() {
        let alloc = Allocator::<u32>::new();
        let ptr = alloc.allocate(0).unwrap();
        assert_eq!(ptr, NonNull::dangling());
        unsafe {
            alloc.deallocate(ptr.as_ptr(), 0);
            alloc.deallocate(ptr::null_mut(), 5);
        }

        let units = Allocator::<()>::new();
        assert_eq!(units.allocate(1000).unwrap(), NonNull::dangling());
        unsafe { units.deallocate(NonNull::dangling().as_ptr(), 1000) };
    }

    #[test]
    fn single_values() {
        let alloc = Allocator::<u8, Local>::new();
        let ptrs = (0..=255u8).map(|value| {
            let ptr = alloc.allocate(1).unwrap();
            unsafe { ptr.as_ptr().write(value) };
            ptr
        }).collect::<Vec<_>>();
        for (value, ptr) in (0..=255u8).zip(&ptrs) {
            assert_eq!(unsafe { *ptr.as_ptr() }, value);
        }
        for ptr in ptrs {
            unsafe { alloc.deallocate(ptr.as_ptr(), 1) };
        }
    }

    #[test]
    fn power_of_two_sizes() {
        let alloc = Allocator::<u8>::new();
        let mut size = 8;
        while size <= 4096 {
            let ptr = alloc.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % size, 0);
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), 0x5a, size);
                alloc.deallocate(ptr.as_ptr(), size);
            }
            size *= 2;
        }
    }

    #[test]
    fn other_sizes() {
        let alloc = Allocator::<u8>::new();
        let mut ptrs = [1, 7, 9, 100, 1000, 3000, 10_000, 1_000_000]
            .iter()
            .map(|&size| {
                let ptr = alloc.allocate(size).unwrap();
                unsafe { ptr::write_bytes(ptr.as_ptr(), 0xc3, size) };
                (ptr, size)
            })
            .collect::<Vec<_>>();
        ptrs.shuffle(&mut rand::thread_rng());
        for (ptr, size) in ptrs {
            unsafe {
                assert_eq!(*ptr.as_ptr().add(size - 1), 0xc3);
                alloc.deallocate(ptr.as_ptr(), size);
            }
        }
    }

    #[test]
    fn oversized_allocation() {
        let alloc = Allocator::<u8>::new();
        let size = 5 * 1024 * 1024;
        assert!(size > MAX_SIZE_CLASS);
        let ptr = alloc.allocate(size).unwrap();
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0xff, size);
            assert_eq!(*ptr.as_ptr().add(size / 2), 0xff);
            alloc.deallocate(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn overaligned_type() {
        #[repr(align(64))]
        struct CacheLine([u8; 64]);

        let alloc = Allocator::<CacheLine>::new();
        for n in 1..10 {
            let ptr = alloc.allocate(n).unwrap();
            check_aligned(ptr);
            unsafe { alloc.deallocate(ptr.as_ptr(), n) };
        }
    }

    #[test]
    fn alignment_beyond_page_size() {
        // Larger than the page size of any supported target
        #[repr(align(1048576))]
        struct Huge(u8);

        let alloc = Allocator::<Huge>::new();
        match alloc.allocate(1) {
            Err(AllocError::UnsupportedAlignment { align, page_size }) => {
                assert_eq!(align, 1 << 20);
                assert_eq!(page_size, os::page_size());
            }
            other => panic!("Unexpected allocation result: {:?}", other),
        }

        // Empty requests never reach the alignment check
        assert_eq!(alloc.allocate(0).unwrap(), NonNull::dangling());
    }

    #[test]
    fn growable_buffer() {
        // Container-style usage: storage is reallocated at twice the capacity
        // whenever it is full, and elements are moved over.
        let alloc = Allocator::<String>::new();
        let mut capacity = 1;
        let mut len = 0;
        let mut storage = alloc.allocate(capacity).unwrap();
        for i in 0..1000 {
            if len == capacity {
                let new_storage = alloc.allocate(2 * capacity).unwrap();
                unsafe {
                    ptr::copy_nonoverlapping(storage.as_ptr(), new_storage.as_ptr(), len);
                    alloc.deallocate(storage.as_ptr(), capacity);
                }
                storage = new_storage;
                capacity *= 2;
            }
            unsafe { storage.as_ptr().add(len).write(i.to_string()) };
            len += 1;
        }

        for i in 0..len {
            assert_eq!(unsafe { &*storage.as_ptr().add(i) }, &i.to_string());
        }
        unsafe {
            for i in 0..len {
                ptr::drop_in_place(storage.as_ptr().add(i));
            }
            alloc.deallocate(storage.as_ptr(), capacity);
        }
    }

    #[test]
    fn capacity_overflow() {
        let alloc = Allocator::<u64>::new();
        match alloc.allocate(usize::MAX / 2) {
            Err(AllocError::CapacityOverflow { count, elem_size }) => {
                assert_eq!(count, usize::MAX / 2);
                assert_eq!(elem_size, 8);
            }
            other => panic!("Unexpected allocation result: {:?}", other),
        }
    }

    #[test]
    fn rebinding() {
        let bytes = Allocator::<u8>::new();
        let words = bytes.rebind::<u64>();
        assert!(bytes == words);

        // Same policy, same registry: storage can cross element types
        let ptr = words.allocate(4).unwrap();
        unsafe { bytes.deallocate(ptr.cast::<u8>().as_ptr(), 32) };
        assert_eq!(format!("{:?}", words.rebind::<u32>()),
                   "Allocator { policy: \"local\", element_size: 4 }");
    }

    #[test]
    fn shared_across_threads() {
        const NUM_THREADS: usize = 8;
        const NUM_BLOCKS: usize = 1000;

        let threads = (0..NUM_THREADS).map(|thread_idx| {
            thread::spawn(move || {
                let alloc = Allocator::<usize, Shared>::new();
                let ptrs = (0..NUM_BLOCKS).map(|i| {
                    let ptr = alloc.allocate(1).unwrap();
                    unsafe { ptr.as_ptr().write(thread_idx * NUM_BLOCKS + i) };
                    ptr.as_ptr() as usize
                }).collect::<Vec<_>>();
                for (i, &addr) in ptrs.iter().enumerate() {
                    let ptr = addr as *mut usize;
                    unsafe {
                        assert_eq!(*ptr, thread_idx * NUM_BLOCKS + i);
                        alloc.deallocate(ptr, 1);
                    }
                }
            })
        }).collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn shared_cross_thread_free() {
        let alloc = Allocator::<u32, Shared>::new();
        let addrs = (0..100).map(|i| {
            let ptr = alloc.allocate(1).unwrap();
            unsafe { ptr.as_ptr().write(i) };
            ptr.as_ptr() as usize
        }).collect::<Vec<_>>();
        thread::spawn(move || {
            let alloc = Allocator::<u32, Shared>::new();
            for (i, addr) in addrs.into_iter().enumerate() {
                unsafe {
                    assert_eq!(*(addr as *const u32), i as u32);
                    alloc.deallocate(addr as *mut u32, 1);
                }
            }
        }).join().unwrap();
    }
}
