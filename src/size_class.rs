//! Power-of-two size classes
//!
//! Every request is rounded up to one of `NUM_SIZE_CLASSES` block sizes, from
//! `MIN_SIZE_CLASS` to `MAX_SIZE_CLASS`. Larger requests are not classed at all
//! and go straight to the operating system.

/// Smallest block size handed out by the allocator (in bytes)
pub const MIN_SIZE_CLASS: usize = 8;

/// Largest block size handed out by an arena pool (in bytes)
pub const MAX_SIZE_CLASS: usize = 4 * 1024 * 1024;

/// Number of distinct size classes, and thus of arena pools per registry
pub const NUM_SIZE_CLASSES: usize =
    (MAX_SIZE_CLASS.trailing_zeros() - MIN_SIZE_CLASS.trailing_zeros()) as usize + 1;

/// Size class returned for requests that are too large to be pooled
pub const UNCLASSED: usize = 0;


/// Round a request size up to its size class
///
/// Returns `MIN_SIZE_CLASS` for every request of `MIN_SIZE_CLASS` bytes or
/// less, `UNCLASSED` for requests above `MAX_SIZE_CLASS`, and the smallest
/// power of two that is greater than or equal to `size` otherwise.
pub const fn round_to_size_class(size: usize) -> usize {
    if size <= MIN_SIZE_CLASS {
        return MIN_SIZE_CLASS;
    }
    if size > MAX_SIZE_CLASS {
        return UNCLASSED;
    }
    1 << (usize::BITS - (size - 1).leading_zeros())
}

/// Dense index of a size class, in `0..NUM_SIZE_CLASSES`
///
/// Only meaningful for values returned by `round_to_size_class()` other than
/// `UNCLASSED`.
pub const fn size_to_index(size_class: usize) -> usize {
    debug_assert!(size_class.is_power_of_two(), "Size class must be a power of 2");
    debug_assert!(size_class >= MIN_SIZE_CLASS && size_class <= MAX_SIZE_CLASS,
                  "Size class is out of the pooled range");
    (size_class.trailing_zeros() - MIN_SIZE_CLASS.trailing_zeros()) as usize
}

/// Size class at a given dense index (inverse of `size_to_index()`)
pub const fn index_to_size(index: usize) -> usize {
    debug_assert!(index < NUM_SIZE_CLASSES, "Size class index is out of range");
    MIN_SIZE_CLASS << index
}
