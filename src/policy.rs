//! Thread-local vs thread-safe bookkeeping
//!
//! All allocator algorithms are written once, against the `Slot` abstraction
//! of a mutable machine word. The `Local` policy backs slots with `Cell`, which
//! makes every data structure built on top of it `!Sync` and thus confined to
//! the thread that created it. The `Shared` policy backs them with atomics.

use crate::registry::{self, Registry};

use std::{
    cell::Cell,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};


/// A mutable machine word with atomic-like read-modify-write operations
///
/// Atomic implementations honor the requested memory orderings. `Cell`
/// implementations ignore them, which is fine since they cannot be observed
/// from another thread.
pub trait Slot: Send {
    /// Value stored in the slot
    type Value: Copy + Eq;

    /// Create a slot holding `value`
    fn new(value: Self::Value) -> Self;

    /// Read the current value
    fn load(&self, order: Ordering) -> Self::Value;

    /// Overwrite the current value
    fn store(&self, value: Self::Value, order: Ordering);

    /// Wrapping addition, returns the former value
    fn fetch_add(&self, value: Self::Value, order: Ordering) -> Self::Value;

    /// Wrapping subtraction, returns the former value
    fn fetch_sub(&self, value: Self::Value, order: Ordering) -> Self::Value;

    /// Bitwise or, returns the former value
    fn fetch_or(&self, value: Self::Value, order: Ordering) -> Self::Value;

    /// Bitwise and, returns the former value
    fn fetch_and(&self, value: Self::Value, order: Ordering) -> Self::Value;

    /// Store `new` if the current value is `current`
    ///
    /// Returns the former value, wrapped in `Ok` on success and `Err` on
    /// failure.
    fn compare_exchange(&self,
                        current: Self::Value,
                        new: Self::Value,
                        success: Ordering,
                        failure: Ordering) -> Result<Self::Value, Self::Value>;

    /// Like `compare_exchange`, but may fail spuriously
    fn compare_exchange_weak(&self,
                             current: Self::Value,
                             new: Self::Value,
                             success: Ordering,
                             failure: Ordering) -> Result<Self::Value, Self::Value>;
}

macro_rules! atomic_slot {
    ($atomic:ty, $value:ty) => {
        impl Slot for $atomic {
            type Value = $value;

            #[inline]
            fn new(value: $value) -> Self {
                <$atomic>::new(value)
            }

            #[inline]
            fn load(&self, order: Ordering) -> $value {
                <$atomic>::load(self, order)
            }

            #[inline]
            fn store(&self, value: $value, order: Ordering) {
                <$atomic>::store(self, value, order)
            }

            #[inline]
            fn fetch_add(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_add(self, value, order)
            }

            #[inline]
            fn fetch_sub(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_sub(self, value, order)
            }

            #[inline]
            fn fetch_or(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_or(self, value, order)
            }

            #[inline]
            fn fetch_and(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_and(self, value, order)
            }

            #[inline]
            fn compare_exchange(&self,
                                current: $value,
                                new: $value,
                                success: Ordering,
                                failure: Ordering) -> Result<$value, $value> {
                <$atomic>::compare_exchange(self, current, new, success, failure)
            }

            #[inline]
            fn compare_exchange_weak(&self,
                                     current: $value,
                                     new: $value,
                                     success: Ordering,
                                     failure: Ordering) -> Result<$value, $value> {
                <$atomic>::compare_exchange_weak(self, current, new, success, failure)
            }
        }
    };
}

atomic_slot!(AtomicU64, u64);
atomic_slot!(AtomicUsize, usize);

macro_rules! cell_slot {
    ($value:ty) => {
        impl Slot for Cell<$value> {
            type Value = $value;

            #[inline]
            fn new(value: $value) -> Self {
                Cell::new(value)
            }

            #[inline]
            fn load(&self, _order: Ordering) -> $value {
                self.get()
            }

            #[inline]
            fn store(&self, value: $value, _order: Ordering) {
                self.set(value)
            }

            #[inline]
            fn fetch_add(&self, value: $value, _order: Ordering) -> $value {
                self.replace(self.get().wrapping_add(value))
            }

            #[inline]
            fn fetch_sub(&self, value: $value, _order: Ordering) -> $value {
                self.replace(self.get().wrapping_sub(value))
            }

            #[inline]
            fn fetch_or(&self, value: $value, _order: Ordering) -> $value {
                self.replace(self.get() | value)
            }

            #[inline]
            fn fetch_and(&self, value: $value, _order: Ordering) -> $value {
                self.replace(self.get() & value)
            }

            #[inline]
            fn compare_exchange(&self,
                                current: $value,
                                new: $value,
                                _success: Ordering,
                                _failure: Ordering) -> Result<$value, $value> {
                let observed = self.get();
                if observed == current {
                    self.set(new);
                    Ok(observed)
                } else {
                    Err(observed)
                }
            }

            #[inline]
            fn compare_exchange_weak(&self,
                                     current: $value,
                                     new: $value,
                                     success: Ordering,
                                     failure: Ordering) -> Result<$value, $value> {
                Slot::compare_exchange(self, current, new, success, failure)
            }
        }
    };
}

cell_slot!(u64);
cell_slot!(usize);


mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Local {}
    impl Sealed for super::Shared {}
}

/// Synchronization discipline of an allocator
///
/// This trait is sealed: `Local` and `Shared` are the only policies.
pub trait Policy: sealed::Sealed + Sized + 'static {
    /// Storage for one 64-bit word of an arena's free bitmap
    type Word: Slot<Value = u64>;

    /// Storage for cursors and counters
    type Counter: Slot<Value = usize>;

    /// Human-readable policy name, used in log events
    const NAME: &'static str;

    /// Run `f` on the registry that serves this policy's `Allocator`s
    ///
    /// The registry is built on first use (per thread for `Local`, once per
    /// process for `Shared`) and is never torn down.
    fn with_registry<R>(f: impl FnOnce(&Registry<Self>) -> R) -> R;
}

/// Unsynchronized, thread-private bookkeeping
///
/// Each thread gets its own set of arena pools. Memory allocated under this
/// policy must be deallocated by the thread that allocated it.
#[derive(Debug)]
pub enum Local {}

impl Policy for Local {
    type Word = Cell<u64>;
    type Counter = Cell<usize>;
    const NAME: &'static str = "local";

    fn with_registry<R>(f: impl FnOnce(&Registry<Self>) -> R) -> R {
        registry::with_local(f)
    }
}

/// Atomic, process-wide bookkeeping
///
/// All threads share one set of arena pools, and memory may be deallocated by
/// a different thread than the one that allocated it.
#[derive(Debug)]
pub enum Shared {}

impl Policy for Shared {
    type Word = AtomicU64;
    type Counter = AtomicUsize;
    const NAME: &'static str = "shared";

    fn with_registry<R>(f: impl FnOnce(&Registry<Self>) -> R) -> R {
        f(registry::shared())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn check_word<S: Slot<Value = u64>>() {
        let word = S::new(0b1010);
        assert_eq!(word.fetch_or(0b0101, Ordering::Release), 0b1010);
        assert_eq!(word.load(Ordering::Acquire), 0b1111);
        assert_eq!(word.fetch_and(!0b0010, Ordering::Release), 0b1111);
        assert_eq!(word.load(Ordering::Relaxed), 0b1101);
        assert_eq!(word.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire),
                   Err(0b1101));
        assert_eq!(word.compare_exchange(0b1101, 1, Ordering::AcqRel, Ordering::Acquire),
                   Ok(0b1101));
        word.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(word.fetch_add(1, Ordering::Relaxed), u64::MAX);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    fn check_counter<S: Slot<Value = usize>>() {
        let counter = S::new(3);
        assert_eq!(counter.fetch_add(2, Ordering::Relaxed), 3);
        assert_eq!(counter.fetch_sub(1, Ordering::Relaxed), 5);
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            match counter.compare_exchange_weak(current, current * 10,
                                                Ordering::AcqRel,
                                                Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn local_slots() {
        check_word::<<Local as Policy>::Word>();
        check_counter::<<Local as Policy>::Counter>();
    }

    #[test]
    fn shared_slots() {
        check_word::<<Shared as Policy>::Word>();
        check_counter::<<Shared as Policy>::Counter>();
    }
}
