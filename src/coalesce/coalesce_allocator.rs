//! Coalescing allocator over a growing sequence of arenas.

use alloc::vec::Vec;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error};

use super::coalesce_block::{BLOCK_ALIGN, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
use super::coalesce_page::CoalescePage;
use crate::page_source::PageSource;
use crate::stats::{BlockInfo, BlockState, CoalesceStats};
use crate::{AllocError, AllocResult};

/// First-fit allocator for variable-size blocks.
///
/// Each arena holds `arena_size` bytes. When no arena can satisfy a request a
/// new one is reserved; arenas are only released by `destroy`.
pub struct CoalesceAllocator {
    arena_size: usize,
    pages: Vec<CoalescePage>,
}

impl CoalesceAllocator {
    pub const fn new(arena_size: usize) -> Self {
        Self {
            arena_size: crate::align_down(arena_size, BLOCK_ALIGN),
            pages: Vec::new(),
        }
    }

    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// Largest request an arena can serve.
    pub fn max_block_size(&self) -> usize {
        self.arena_size.saturating_sub(BLOCK_HEADER_SIZE)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Reserve the first arena. Does nothing if an arena already exists.
    pub fn init(&mut self, source: &mut dyn PageSource) -> AllocResult {
        if self.arena_size < BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE {
            error!(
                "coalesce allocator: arena of {} bytes cannot hold a block",
                self.arena_size
            );
            return Err(AllocError::InvalidParam);
        }
        if self.pages.is_empty() {
            self.grow(source)?;
        }
        Ok(())
    }

    /// Release every arena back to `source`.
    pub fn destroy(&mut self, source: &mut dyn PageSource) {
        for page in self.pages.drain(..) {
            source.dealloc_pages(page.base(), page.num_pages());
        }
    }

    pub fn alloc(
        &mut self,
        size: usize,
        source: &mut dyn PageSource,
    ) -> AllocResult<NonNull<u8>> {
        let size = Self::round_request(size)?;
        if size > self.max_block_size() {
            return Err(AllocError::InvalidParam);
        }

        for page in self.pages.iter_mut() {
            if let Some(addr) = page.alloc(size)? {
                return NonNull::new(addr as *mut u8).ok_or(AllocError::Corruption);
            }
        }

        let page = self.grow(source)?;
        let addr = page.alloc(size)?.ok_or(AllocError::Corruption)?;
        NonNull::new(addr as *mut u8).ok_or(AllocError::Corruption)
    }

    /// Release a block.
    ///
    /// Returns `Ok(false)` when no arena contains `ptr`.
    pub fn free(&mut self, ptr: NonNull<u8>) -> AllocResult<bool> {
        let addr = ptr.as_ptr() as usize;
        let Some(page) = self.pages.iter_mut().find(|page| page.contains(addr)) else {
            return Ok(false);
        };

        page.free(addr)?;
        Ok(true)
    }

    /// Whether `ptr` lies inside one of the arenas.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.pages.iter().any(|page| page.contains(addr))
    }

    pub fn stats(&self) -> CoalesceStats {
        let mut stats = CoalesceStats {
            pages: self.pages.len(),
            arena_size: self.arena_size,
            ..CoalesceStats::default()
        };

        for block in self.blocks() {
            match block.state {
                BlockState::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                    stats.largest_free_block = stats.largest_free_block.max(block.size);
                }
                BlockState::Allocated => {
                    stats.used_blocks += 1;
                    stats.used_bytes += block.size;
                }
            }
        }
        stats
    }

    /// Every block of every arena in physical order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.pages.iter().flat_map(|page| page.blocks())
    }

    fn round_request(size: usize) -> AllocResult<usize> {
        size.max(MIN_BLOCK_SIZE)
            .checked_add(BLOCK_ALIGN - 1)
            .map(|size| size & !(BLOCK_ALIGN - 1))
            .ok_or(AllocError::InvalidParam)
    }

    fn grow(&mut self, source: &mut dyn PageSource) -> AllocResult<&mut CoalescePage> {
        let num_pages = source.pages_for(self.arena_size)?;
        let base = source.alloc_pages(num_pages)?;
        debug!(
            "coalesce allocator: new arena {} at {:#x} ({} bytes)",
            self.pages.len(),
            base,
            self.arena_size
        );

        self.pages
            .push(CoalescePage::new(base, self.arena_size, num_pages));
        let last = self.pages.len() - 1;
        Ok(&mut self.pages[last])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source::HeapPageSource;
    use alloc::vec::Vec;

    const ARENA: usize = 64 * 1024;

    fn setup() -> (HeapPageSource, CoalesceAllocator) {
        let mut source = HeapPageSource::new();
        let mut allocator = CoalesceAllocator::new(ARENA);
        allocator.init(&mut source).unwrap();
        (source, allocator)
    }

    #[test]
    fn test_alloc_write_free_realloc() {
        let (mut source, mut allocator) = setup();

        let ptr = allocator.alloc(1000, &mut source).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), 1000) };
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i % 0xff) as u8;
        }
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == (i % 0xff) as u8));

        assert_eq!(allocator.free(ptr), Ok(true));
        let again = allocator.alloc(1000, &mut source).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(allocator.page_count(), 1);

        allocator.destroy(&mut source);
        assert_eq!(source.reserved_pages(), 0);
    }

    #[test]
    fn test_request_rounding() {
        let (mut source, mut allocator) = setup();

        let a = allocator.alloc(1, &mut source).unwrap();
        let b = allocator.alloc(17, &mut source).unwrap();
        assert_eq!(a.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            MIN_BLOCK_SIZE + BLOCK_HEADER_SIZE
        );

        let sizes: Vec<_> = allocator.blocks().map(|block| block.size).collect();
        assert_eq!(sizes[..2], [16, 32]);

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_grows_when_full() {
        let (mut source, mut allocator) = setup();

        let big = allocator.max_block_size();
        let a = allocator.alloc(big, &mut source).unwrap();
        let b = allocator.alloc(64, &mut source).unwrap();
        assert_eq!(allocator.page_count(), 2);
        assert!(allocator.owns(a));
        assert!(allocator.owns(b));

        assert_eq!(allocator.free(a), Ok(true));
        assert_eq!(allocator.free(b), Ok(true));

        let stats = allocator.stats();
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.largest_free_block, big);

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_request_above_capacity_rejected() {
        let (mut source, mut allocator) = setup();

        let too_big = allocator.max_block_size() + 1;
        assert_eq!(
            allocator.alloc(too_big, &mut source),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(
            allocator.alloc(usize::MAX, &mut source),
            Err(AllocError::InvalidParam)
        );

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let (mut source, mut allocator) = setup();

        let a = allocator.alloc(256, &mut source).unwrap();
        let b = allocator.alloc(512, &mut source).unwrap();
        let c = allocator.alloc(64, &mut source).unwrap();

        allocator.free(b).unwrap();
        allocator.free(a).unwrap();

        let first = allocator.blocks().next().unwrap();
        assert_eq!(first.addr, a.as_ptr() as usize);
        assert_eq!(first.state, BlockState::Free);
        assert_eq!(first.size, 256 + 512 + BLOCK_HEADER_SIZE);

        allocator.free(c).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, allocator.max_block_size());

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_foreign_pointer_not_owned() {
        let (mut source, mut allocator) = setup();

        let mut local = [0u8; 64];
        let foreign = NonNull::new(local.as_mut_ptr()).unwrap();
        assert_eq!(allocator.free(foreign), Ok(false));

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_out_of_memory_on_growth() {
        let mut source = HeapPageSource::with_page_limit(ARENA / crate::DEFAULT_PAGE_SIZE);
        let mut allocator = CoalesceAllocator::new(ARENA);
        allocator.init(&mut source).unwrap();

        allocator
            .alloc(allocator.max_block_size(), &mut source)
            .unwrap();
        assert_eq!(
            allocator.alloc(16, &mut source),
            Err(AllocError::OutOfMemory)
        );

        allocator.destroy(&mut source);
    }

    #[test]
    fn test_tiny_arena_rejected() {
        let mut source = HeapPageSource::new();
        let mut allocator = CoalesceAllocator::new(BLOCK_HEADER_SIZE);
        assert_eq!(allocator.init(&mut source), Err(AllocError::InvalidParam));
    }
}
