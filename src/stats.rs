//! Statistics and debugging for the allocators
//!
//! Snapshots are plain data and always available; the reporter renders them
//! through the logging layer.

use core::fmt;

use crate::fixed::SizeClass;

/// Whether a block is handed out or sitting in a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// One block as seen by `dump_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address.
    pub addr: usize,
    /// Payload size in bytes.
    pub size: usize,
    pub state: BlockState,
}

/// Counters of one fixed-size allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedSizeStats {
    pub block_size: usize,
    pub pages: usize,
    /// Pages with no block handed out.
    pub empty_pages: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
}

impl FixedSizeStats {
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pages: 0,
            empty_pages: 0,
            total_blocks: 0,
            used_blocks: 0,
            free_blocks: 0,
        }
    }
}

/// Counters of the coalescing allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceStats {
    pub pages: usize,
    pub arena_size: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free_block: usize,
}

/// Snapshot of the whole memory allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub size_classes: [FixedSizeStats; SizeClass::COUNT],
    pub coalesce: CoalesceStats,
    /// Live oversized blocks served straight from the page source.
    pub os_blocks: usize,
    pub os_bytes: usize,
    pub page_size: usize,
    /// Pages currently reserved from the page source, all users included.
    pub reserved_pages: usize,
}

impl AllocatorStats {
    /// Blocks handed out by the pools and the arenas, oversized blocks included.
    pub fn live_allocations(&self) -> usize {
        self.size_classes
            .iter()
            .map(|class| class.used_blocks)
            .sum::<usize>()
            + self.coalesce.used_blocks
            + self.os_blocks
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_pages * self.page_size
    }
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print a summary of every sub-allocator
    #[allow(unused_variables)]
    pub fn print_stats(stats: &AllocatorStats) {
        #[cfg(feature = "log")]
        use log::info;

        info!("========================================");
        info!(
            "Reserved: {} pages ({} KB), page size {} B",
            stats.reserved_pages,
            stats.reserved_bytes() / 1024,
            stats.page_size
        );
        info!("Live allocations: {}", stats.live_allocations());
        info!("Fixed-size pools:");
        for class in &stats.size_classes {
            info!(
                "  {:>4} B: {} pages ({} empty), {} used / {} free of {} blocks",
                class.block_size,
                class.pages,
                class.empty_pages,
                class.used_blocks,
                class.free_blocks,
                class.total_blocks
            );
        }

        let coalesce = &stats.coalesce;
        info!("Coalescing arenas:");
        info!(
            "  {} pages of {} KB",
            coalesce.pages,
            coalesce.arena_size / 1024
        );
        info!(
            "  Used: {} blocks, {} B",
            coalesce.used_blocks, coalesce.used_bytes
        );
        info!(
            "  Free: {} blocks, {} B (largest {} B)",
            coalesce.free_blocks, coalesce.free_bytes, coalesce.largest_free_block
        );
        info!(
            "Oversized blocks: {} ({} KB)",
            stats.os_blocks,
            stats.os_bytes / 1024
        );
        info!("========================================");
    }

    /// Print one line per block, prefixed with the owner name
    #[allow(unused_variables)]
    pub fn print_blocks(owner: impl fmt::Display, blocks: impl Iterator<Item = BlockInfo>) {
        #[cfg(feature = "log")]
        use log::debug;

        for block in blocks {
            debug!(
                "{}: [{:#x}, {:#x}) {} B {:?}",
                owner,
                block.addr,
                block.addr + block.size,
                block.size,
                block.state
            );
        }
    }

    /// Print detailed allocation failure statistics
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(request_size: usize, stats: &AllocatorStats) {
        #[cfg(feature = "log")]
        use log::error;

        error!("========================================");
        error!("Request: {} B ({} KB)", request_size, request_size / 1024);
        error!(
            "  Reserved pages: {} ({} KB)",
            stats.reserved_pages,
            stats.reserved_bytes() / 1024
        );
        error!(
            "  Coalescing arenas: {}, free {} B, largest free block {} B",
            stats.coalesce.pages, stats.coalesce.free_bytes, stats.coalesce.largest_free_block
        );
        error!(
            "  Oversized blocks: {} ({} KB)",
            stats.os_blocks,
            stats.os_bytes / 1024
        );
        error!("========================================");
    }
}
