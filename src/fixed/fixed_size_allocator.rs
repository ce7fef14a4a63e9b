//! Fixed-size allocator for a single size class.
//!
//! Pages are appended on demand and never released before `destroy`.

use alloc::vec::Vec;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error};

use super::fixed_page::FixedSizePage;
use super::size_class::SizeClass;
use crate::page_source::PageSource;
use crate::stats::{BlockInfo, BlockState, FixedSizeStats};
use crate::{AllocError, AllocResult};

/// Pool allocator serving blocks of one size class.
pub struct FixedSizeAllocator {
    size_class: SizeClass,
    pages: Vec<FixedSizePage>,
}

impl FixedSizeAllocator {
    pub const fn new(size_class: SizeClass) -> Self {
        Self {
            size_class,
            pages: Vec::new(),
        }
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn block_size(&self) -> usize {
        self.size_class.size()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Reserve the first page. Does nothing if a page already exists.
    pub fn init(&mut self, source: &mut dyn PageSource) -> AllocResult {
        if self.pages.is_empty() {
            self.grow(source)?;
        }
        Ok(())
    }

    /// Release every page back to `source`.
    pub fn destroy(&mut self, source: &mut dyn PageSource) {
        for page in self.pages.drain(..) {
            source.dealloc_pages(page.base(), 1);
        }
    }

    /// Allocate one block, growing by a page when every page is full.
    pub fn alloc(&mut self, source: &mut dyn PageSource) -> AllocResult<NonNull<u8>> {
        let addr = match self.pages.iter().position(|page| !page.is_full()) {
            Some(index) => self.pages[index].alloc_block(),
            None => self.grow(source)?.alloc_block(),
        };

        let Some(addr) = addr else {
            error!(
                "fixed allocator {}: free list empty on a page reporting free blocks",
                self.block_size()
            );
            return Err(AllocError::Corruption);
        };
        NonNull::new(addr as *mut u8).ok_or(AllocError::Corruption)
    }

    /// Release a block.
    ///
    /// Returns `Ok(false)` when no page of this allocator contains `ptr`, and
    /// [`AllocError::InvalidFree`] when a page contains it but it is not a
    /// live block.
    pub fn free(&mut self, ptr: NonNull<u8>) -> AllocResult<bool> {
        let addr = ptr.as_ptr() as usize;
        let Some(page) = self.pages.iter_mut().find(|page| page.contains(addr)) else {
            return Ok(false);
        };

        page.free_block(addr)?;
        Ok(true)
    }

    /// Whether `ptr` lies inside one of this allocator's pages.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.pages.iter().any(|page| page.contains(addr))
    }

    pub fn stats(&self) -> FixedSizeStats {
        let mut stats = FixedSizeStats::new(self.block_size());
        stats.pages = self.pages.len();
        for page in &self.pages {
            stats.total_blocks += page.block_count();
            stats.free_blocks += page.free_count();
            stats.used_blocks += page.in_use();
            if page.is_empty() {
                stats.empty_pages += 1;
            }
        }
        stats
    }

    /// Every block of every page, in address order within each page.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let block_size = self.block_size();
        self.pages.iter().flat_map(move |page| {
            (0..page.block_count()).map(move |index| BlockInfo {
                addr: page.block_addr(index),
                size: block_size,
                state: if page.is_block_free(index) {
                    BlockState::Free
                } else {
                    BlockState::Allocated
                },
            })
        })
    }

    fn grow(&mut self, source: &mut dyn PageSource) -> AllocResult<&mut FixedSizePage> {
        let page_size = source.page_size();
        if page_size < self.block_size() {
            return Err(AllocError::InvalidParam);
        }

        let base = source.alloc_pages(1)?;
        let page = FixedSizePage::new(base, page_size, self.size_class);
        debug!(
            "fixed allocator {}: new page {} at {:#x} with {} blocks",
            self.block_size(),
            self.pages.len(),
            base,
            page.block_count()
        );

        self.pages.push(page);
        let last = self.pages.len() - 1;
        Ok(&mut self.pages[last])
    }
}
