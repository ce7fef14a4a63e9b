//! Segregated pool and coalescing memory allocator
//!
//! This crate implements a user-space memory manager featuring:
//! - Fixed-size pools for the 16/32/64/128/256/512 byte size classes
//! - A first-fit coalescing arena for mid-size requests
//! - Direct page-source allocations for oversized requests
//! - A single lock serializing every operation on the facade

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Page size assumed by the heap page source.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Default capacity of one coalescing arena, in bytes.
pub const DEFAULT_ARENA_SIZE: usize = 10_000_000;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The request cannot be expressed (e.g. size overflow).
    InvalidParam,
    /// The page source could not reserve more memory.
    OutOfMemory,
    /// The pointer is not a live allocation of this allocator.
    InvalidFree,
    /// Block metadata violates an arena invariant.
    Corruption,
    /// The allocator is used before `init` or after `destroy`.
    NotInitialized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid allocation request",
            AllocError::OutOfMemory => "out of memory",
            AllocError::InvalidFree => "pointer is not a live allocation",
            AllocError::Corruption => "allocator metadata is corrupted",
            AllocError::NotInitialized => "allocator is not initialized",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Run-time configuration of a [`MemoryAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Bytes reserved for each coalescing arena. Requests larger than an
    /// arena (minus one block header) bypass the pools entirely.
    pub arena_size: usize,
}

impl AllocatorConfig {
    pub const fn new() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }

    pub const fn with_arena_size(arena_size: usize) -> Self {
        Self { arena_size }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod page_source;
#[cfg(unix)]
pub use page_source::MmapPageSource;
pub use page_source::{DefaultPageSource, HeapPageSource, PageSource};

pub mod fixed;
pub use fixed::{FixedSizeAllocator, SizeClass};

pub mod coalesce;
pub use coalesce::{CoalesceAllocator, BLOCK_ALIGN, BLOCK_HEADER_SIZE};

pub mod stats;
pub use stats::{
    AllocatorStats, BlockInfo, BlockState, CoalesceStats, FixedSizeStats, MemoryStatsReporter,
};

pub mod memory_allocator;
pub use memory_allocator::MemoryAllocator;
