//! Memory-footprint accounting traits.
//!
//! Containers and models report their total in-RAM footprint, headers and
//! payload included, so that pool budgets and the partial-loading decision
//! can be computed without walking allocator internals.

/// A type which can report its current total memory footprint in bytes.
pub trait Size {
    /// Total number of bytes occupied, including the object header and any
    /// heap payload it owns.
    fn size(&self) -> usize;

    /// A more expensive, exact recomputation of [`Size::size`].
    ///
    /// Returns `None` if no cheaper estimate exists; implementations with a
    /// cached size may use this to cross-check it.
    fn actual_size(&self) -> Option<usize> {
        None
    }
}

/// A type whose footprint is known at compile time.
pub trait StaticSize {
    /// The constant size of this type in bytes.
    fn static_size() -> usize;
}

impl<T: StaticSize> Size for T {
    fn size(&self) -> usize {
        T::static_size()
    }
}

impl StaticSize for crate::allocator::MemoryStatus {
    fn static_size() -> usize {
        std::mem::size_of::<Self>()
    }
}
