//! Mechanism for building an `ArenaPool`, with proper invariant checking

use crate::{
    pool::{ArenaPool, MAX_ARENAS},
    policy::Policy,
    size_class::{self, MAX_SIZE_CLASS, MIN_SIZE_CLASS, UNCLASSED},
};


/// Builder for an arena pool
//
// NOTE: The main purpose of this builder is to ensure that a certain number of
//       preconditions are upheld upon constructing the pool. These are listed
//       as "must" bullet points in the struct members' doc comments.
#[derive(Debug)]
pub struct PoolBuilder {
    /// Block size in bytes
    /// - Must be specified, either directly or via a request size
    /// - Must be a power of 2, so that block indices are computed by shifting
    /// - Must be between MIN_SIZE_CLASS and MAX_SIZE_CLASS, so that at least
    ///   one block fits in an arena next to its bitmap
    block_size: Option<usize>,

    /// Maximal number of arenas
    /// - Will be set to MAX_ARENAS if unspecified
    /// - Must be between 1 and MAX_ARENAS
    max_arenas: Option<usize>,
}

impl PoolBuilder {
    /// Start building an arena pool
    pub const fn new() -> Self {
        Self {
            block_size: None,
            max_arenas: None,
        }
    }

    /// Set the pool's block size (in bytes)
    ///
    /// Every block handed out by the pool will have this size, and be aligned
    /// to the smaller of this size and the OS page size.
    ///
    /// The block size must be a power of 2 between `MIN_SIZE_CLASS` and
    /// `MAX_SIZE_CLASS`. You must set either the block size or the request
    /// size, but not both.
    pub fn block_size(&mut self, block_size: usize) -> &mut Self {
        assert!(block_size.is_power_of_two(),
                "Block size must be a power of 2");
        assert!(block_size >= MIN_SIZE_CLASS && block_size <= MAX_SIZE_CLASS,
                "Block size must be a valid size class");
        assert!(self.block_size.replace(block_size).is_none(),
                "Block size must only be set once");
        self
    }

    /// Set the pool's block size to the size class of `request` bytes
    ///
    /// This is the pool that the allocator front-end would use to serve
    /// requests of that size.
    ///
    /// You must set either the block size or the request size, but not both.
    pub fn size_class_for(&mut self, request: usize) -> &mut Self {
        let size_class = size_class::round_to_size_class(request);
        assert_ne!(size_class, UNCLASSED,
                   "Request is too large to be served by an arena pool");
        self.block_size(size_class)
    }

    /// Set the maximal number of arenas that the pool may create
    ///
    /// Once that many arenas are full, allocations fail instead of mapping
    /// more memory. This must be between 1 and `MAX_ARENAS`, which is also
    /// the default.
    pub fn max_arenas(&mut self, max_arenas: usize) -> &mut Self {
        assert!(max_arenas >= 1, "Pool must be allowed at least one arena");
        assert!(max_arenas <= MAX_ARENAS,
                "Pool cannot have more than MAX_ARENAS arenas");
        assert!(self.max_arenas.replace(max_arenas).is_none(),
                "Arena limit must only be set once");
        self
    }

    /// Build the previously configured pool
    ///
    /// You must have configured a block size before calling this function.
    /// No memory is mapped until the first allocation.
    pub fn build<P: Policy>(&self) -> ArenaPool<P> {
        let block_size = self.block_size
                             .expect("You must specify a block size");
        let max_arenas = self.max_arenas.unwrap_or(MAX_ARENAS);
        ArenaPool::new_unchecked(block_size, max_arenas)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Local, Shared};

    #[test]
    fn explicit_block_size() {
        let pool = PoolBuilder::new().block_size(128).build::<Local>();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.max_arenas(), MAX_ARENAS);
        assert_eq!(pool.num_arenas(), 0);
    }

    #[test]
    fn block_size_from_request() {
        let pool = PoolBuilder::new().size_class_for(100)
                                     .max_arenas(3)
                                     .build::<Shared>();
        assert_eq!(pool.block_size(), 128);
        assert_eq!(pool.max_arenas(), 3);

        let tiny = PoolBuilder::new().size_class_for(1).build::<Local>();
        assert_eq!(tiny.block_size(), MIN_SIZE_CLASS);
    }

    #[test]
    #[should_panic]
    fn missing_block_size() {
        PoolBuilder::new().max_arenas(1).build::<Local>();
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_block_size() {
        PoolBuilder::new().block_size(24);
    }

    #[test]
    #[should_panic]
    fn block_size_too_small() {
        PoolBuilder::new().block_size(MIN_SIZE_CLASS / 2);
    }

    #[test]
    #[should_panic]
    fn block_size_too_large() {
        PoolBuilder::new().block_size(2 * MAX_SIZE_CLASS);
    }

    #[test]
    #[should_panic]
    fn oversized_request() {
        PoolBuilder::new().size_class_for(MAX_SIZE_CLASS + 1);
    }

    #[test]
    #[should_panic]
    fn block_size_set_twice() {
        PoolBuilder::new().block_size(64).size_class_for(64);
    }

    #[test]
    #[should_panic]
    fn no_arenas() {
        PoolBuilder::new().max_arenas(0);
    }

    #[test]
    #[should_panic]
    fn too_many_arenas() {
        PoolBuilder::new().max_arenas(MAX_ARENAS + 1);
    }
}
