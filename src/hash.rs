//! Zero-sized hash builder for the crate's internal collections.
//!
//! Dependency sets, subscriber sets and the scheduler queue are all hash
//! collections keyed by small integer ids. `FastHashBuilder` gives them a
//! fixed-seed foldhash hasher with no per-collection memory overhead;
//! HashDoS resistance is irrelevant for ids the crate allocates itself.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// Zero-sized `BuildHasher` backed by foldhash with a fixed seed.
///
/// All instances produce identical hash values, so collections built with it
/// hash deterministically across the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}

/// `IndexSet` keyed with [`FastHashBuilder`].
pub type FastIndexSet<T> = indexmap::IndexSet<T, FastHashBuilder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn builder_is_deterministic() {
        let a = FastHashBuilder.hash_one(7u32);
        let b = FastHashBuilder.hash_one(7u32);
        assert_eq!(a, b);
    }
}
