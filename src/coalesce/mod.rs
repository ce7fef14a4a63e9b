//! Coalescing allocator module
//!
//! This module provides a variable-size allocator with:
//! - Address-ordered free lists threaded through in-arena block headers
//! - First-fit search with block splitting
//! - Merging of physically adjacent free blocks on release

pub mod coalesce_allocator;
pub mod coalesce_block;
pub mod coalesce_page;

pub use coalesce_allocator::CoalesceAllocator;
pub use coalesce_block::{CoalesceBlock, BLOCK_ALIGN, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
pub use coalesce_page::CoalescePage;
