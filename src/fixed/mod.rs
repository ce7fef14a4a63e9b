//! Fixed-size pool allocator.
//!
//! Each size class owns a sequence of single-page pools whose blocks are
//! tracked by an index-linked free list kept outside the block storage.

pub mod fixed_page;
pub mod fixed_size_allocator;
pub mod size_class;

// Re-export public types
pub use fixed_page::FixedSizePage;
pub use fixed_size_allocator::FixedSizeAllocator;
pub use size_class::SizeClass;
