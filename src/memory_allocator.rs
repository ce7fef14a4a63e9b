//! Memory allocator facade.
//!
//! This module routes every request to a fixed-size pool, the coalescing
//! arenas, or a dedicated page run, and serializes all of them behind a
//! single lock.

extern crate alloc;

use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use super::coalesce::CoalesceAllocator;
use super::fixed::{FixedSizeAllocator, SizeClass};
use super::page_source::{DefaultPageSource, PageSource};
use super::stats::{AllocatorStats, BlockInfo, BlockState, MemoryStatsReporter};
use crate::{AllocError, AllocResult, AllocatorConfig};

/// Everything guarded by the facade lock.
struct AllocatorState<S: PageSource> {
    source: S,
    fixed: [FixedSizeAllocator; SizeClass::COUNT],
    coalesce: CoalesceAllocator,
    /// Oversized blocks: payload address -> requested size.
    os_blocks: BTreeMap<usize, usize>,
    initialized: bool,
}

impl<S: PageSource> AllocatorState<S> {
    fn new(source: S, config: AllocatorConfig) -> Self {
        Self {
            source,
            fixed: SizeClass::ALL.map(FixedSizeAllocator::new),
            coalesce: CoalesceAllocator::new(config.arena_size),
            os_blocks: BTreeMap::new(),
            initialized: false,
        }
    }

    fn init_all(&mut self) -> AllocResult {
        for allocator in self.fixed.iter_mut() {
            allocator.init(&mut self.source)?;
        }
        self.coalesce.init(&mut self.source)?;
        self.os_blocks.clear();
        Ok(())
    }

    fn destroy_all(&mut self) {
        for allocator in self.fixed.iter_mut() {
            allocator.destroy(&mut self.source);
        }
        self.coalesce.destroy(&mut self.source);

        while let Some((addr, size)) = self.os_blocks.pop_first() {
            if let Ok(num_pages) = self.source.pages_for(size) {
                self.source.dealloc_pages(addr, num_pages);
            }
        }
    }

    fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if let Some(size_class) = SizeClass::from_size(size) {
            return self.fixed[size_class.to_index()].alloc(&mut self.source);
        }

        if size <= self.coalesce.max_block_size() {
            return self.coalesce.alloc(size, &mut self.source);
        }

        self.alloc_os_block(size)
    }

    fn alloc_os_block(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let num_pages = self.source.pages_for(size)?;
        let addr = self.source.alloc_pages(num_pages)?;
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            self.source.dealloc_pages(addr, num_pages);
            return Err(AllocError::OutOfMemory);
        };

        self.os_blocks.insert(addr, size);
        debug!(
            "memory allocator: oversized block of {} bytes at {:#x} ({} pages)",
            size, addr, num_pages
        );
        Ok(ptr)
    }

    fn free(&mut self, ptr: NonNull<u8>) -> AllocResult {
        for allocator in self.fixed.iter_mut() {
            if allocator.free(ptr)? {
                return Ok(());
            }
        }

        if self.coalesce.free(ptr)? {
            return Ok(());
        }

        let addr = ptr.as_ptr() as usize;
        let Some(&size) = self.os_blocks.get(&addr) else {
            warn!("memory allocator: free of unknown pointer {:#x}", addr);
            return Err(AllocError::InvalidFree);
        };

        let num_pages = self.source.pages_for(size)?;
        self.os_blocks.remove(&addr);
        self.source.dealloc_pages(addr, num_pages);
        debug!(
            "memory allocator: released oversized block of {} bytes at {:#x}",
            size, addr
        );
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            coalesce: self.coalesce.stats(),
            os_blocks: self.os_blocks.len(),
            os_bytes: self.os_blocks.values().sum(),
            page_size: self.source.page_size(),
            reserved_pages: self.source.reserved_pages(),
            ..AllocatorStats::default()
        };
        for (slot, allocator) in stats.size_classes.iter_mut().zip(&self.fixed) {
            *slot = allocator.stats();
        }
        stats
    }
}

/// Memory allocator that coordinates the size-class pools, the coalescing
/// arenas and the oversized path under one lock.
///
/// Requests of at most 512 bytes go to the smallest fitting pool, requests up
/// to an arena's capacity go to the coalescing allocator, and anything larger
/// gets its own page run.
pub struct MemoryAllocator<S: PageSource = DefaultPageSource> {
    state: SpinNoIrq<AllocatorState<S>>,
}

impl MemoryAllocator<DefaultPageSource> {
    /// An uninitialized allocator over the platform page source with the
    /// default arena capacity.
    pub fn new() -> Self {
        Self::with_page_source(DefaultPageSource::new(), AllocatorConfig::default())
    }
}

impl Default for MemoryAllocator<DefaultPageSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> MemoryAllocator<S> {
    pub fn with_page_source(source: S, config: AllocatorConfig) -> Self {
        Self {
            state: SpinNoIrq::new(AllocatorState::new(source, config)),
        }
    }

    /// Reserve the first page of every pool and the first arena.
    ///
    /// Calling `init` on an initialized allocator does nothing. On failure
    /// everything reserved so far is released again.
    pub fn init(&self) -> AllocResult {
        let mut state = self.state.lock();
        if state.initialized {
            warn!("memory allocator: already initialized");
            return Ok(());
        }

        if let Err(e) = state.init_all() {
            error!("memory allocator: initialization failed: {}", e);
            state.destroy_all();
            return Err(e);
        }

        state.initialized = true;
        info!(
            "memory allocator: initialized with {} pages reserved",
            state.source.reserved_pages()
        );
        Ok(())
    }

    /// Release every page, arena and oversized block.
    ///
    /// All outstanding pointers become invalid.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if !state.initialized {
            return;
        }

        state.destroy_all();
        state.initialized = false;
        info!("memory allocator: destroyed");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Largest request served from the coalescing arenas; anything larger
    /// gets its own page run.
    pub fn max_arena_request(&self) -> usize {
        self.state.lock().coalesce.max_block_size()
    }

    /// Allocate at least `size` bytes. The memory is not initialized.
    pub fn alloc(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let mut state = self.state.lock();
        if !state.initialized {
            error!("memory allocator: allocation before init");
            return Err(AllocError::NotInitialized);
        }

        let result = state.alloc(size);
        if let Err(AllocError::OutOfMemory) = result {
            MemoryStatsReporter::print_alloc_failure_stats(size, &state.stats());
        }
        result
    }

    /// Release a pointer returned by [`MemoryAllocator::alloc`].
    ///
    /// The pools are probed in size-class order, then the arenas, then the
    /// oversized blocks. A pointer none of them recognizes is
    /// [`AllocError::InvalidFree`].
    pub fn free(&self, ptr: NonNull<u8>) -> AllocResult {
        let mut state = self.state.lock();
        if !state.initialized {
            error!("memory allocator: free before init");
            return Err(AllocError::NotInitialized);
        }

        state.free(ptr)
    }

    /// Get memory statistics
    pub fn stats(&self) -> AllocatorStats {
        self.state.lock().stats()
    }

    /// Log a summary of every sub-allocator.
    pub fn dump_stats(&self) {
        let stats = self.stats();
        MemoryStatsReporter::print_stats(&stats);
    }

    /// Log every block of every sub-allocator.
    pub fn dump_blocks(&self) {
        let state = self.state.lock();
        for allocator in &state.fixed {
            MemoryStatsReporter::print_blocks(
                format_args!("pool {}", allocator.block_size()),
                allocator.blocks(),
            );
        }
        MemoryStatsReporter::print_blocks("arena", state.coalesce.blocks());
        MemoryStatsReporter::print_blocks(
            "oversized",
            state.os_blocks.iter().map(|(&addr, &size)| BlockInfo {
                addr,
                size,
                state: BlockState::Allocated,
            }),
        );
    }
}

impl<S: PageSource> Drop for MemoryAllocator<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
