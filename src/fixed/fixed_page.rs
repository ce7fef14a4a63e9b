//! Fixed-size page descriptor.
//!
//! A `FixedSizePage` describes one page split into equal blocks. The free
//! list is threaded through a per-block descriptor table rather than through
//! the block payloads, so freed storage is never reinterpreted.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::warn;

use super::size_class::SizeClass;
use crate::{AllocError, AllocResult};

/// Terminates the free list.
const FREE_LIST_END: u16 = u16::MAX;
/// Descriptor value of a block that is currently handed out.
const BLOCK_IN_USE: u16 = u16::MAX - 1;

#[derive(Debug)]
pub struct FixedSizePage {
    base: usize,
    page_bytes: usize,
    size_class: SizeClass,
    free_list_root: u16,
    free_count: usize,
    /// Per block: next free index, `FREE_LIST_END`, or `BLOCK_IN_USE`.
    descriptors: Vec<u16>,
}

impl FixedSizePage {
    /// Largest block count a descriptor table can index.
    pub const MAX_BLOCKS: usize = BLOCK_IN_USE as usize;

    /// Describe the page at `base`, with every block free and linked in order.
    pub fn new(base: usize, page_bytes: usize, size_class: SizeClass) -> Self {
        let block_count = (page_bytes / size_class.size()).min(Self::MAX_BLOCKS);

        let mut descriptors = Vec::with_capacity(block_count);
        for index in 1..block_count {
            descriptors.push(index as u16);
        }
        if block_count > 0 {
            descriptors.push(FREE_LIST_END);
        }

        Self {
            base,
            page_bytes,
            size_class,
            free_list_root: if block_count > 0 { 0 } else { FREE_LIST_END },
            free_count: block_count,
            descriptors,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    pub fn block_size(&self) -> usize {
        self.size_class.size()
    }

    pub fn block_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn in_use(&self) -> usize {
        self.block_count() - self.free_count
    }

    pub fn is_full(&self) -> bool {
        self.free_list_root == FREE_LIST_END
    }

    pub fn is_empty(&self) -> bool {
        self.free_count == self.block_count()
    }

    /// Whether `addr` falls inside the page's address range.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.page_bytes
    }

    pub fn block_addr(&self, index: usize) -> usize {
        self.base + index * self.block_size()
    }

    /// Index of the block starting exactly at `addr`.
    pub fn block_index(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }

        let offset = addr - self.base;
        if offset % self.block_size() != 0 {
            return None;
        }

        let index = offset / self.block_size();
        (index < self.block_count()).then_some(index)
    }

    pub fn is_block_free(&self, index: usize) -> bool {
        self.descriptors
            .get(index)
            .is_some_and(|&descriptor| descriptor != BLOCK_IN_USE)
    }

    /// Pop the free-list root. Returns the block address.
    pub fn alloc_block(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }

        let index = self.free_list_root as usize;
        self.free_list_root = self.descriptors[index];
        self.descriptors[index] = BLOCK_IN_USE;
        self.free_count -= 1;
        Some(self.block_addr(index))
    }

    /// Push the block at `addr` onto the front of the free list.
    pub fn free_block(&mut self, addr: usize) -> AllocResult {
        let Some(index) = self.block_index(addr) else {
            warn!(
                "fixed page {:#x}: {:#x} is not a {}-byte block start",
                self.base,
                addr,
                self.block_size()
            );
            return Err(AllocError::InvalidFree);
        };

        if self.descriptors[index] != BLOCK_IN_USE {
            warn!(
                "fixed page {:#x}: double free of block {} at {:#x}",
                self.base, index, addr
            );
            return Err(AllocError::InvalidFree);
        }

        self.descriptors[index] = self.free_list_root;
        self.free_list_root = index as u16;
        self.free_count += 1;
        Ok(())
    }

    /// Walk the free list and check it visits exactly `free_count` distinct
    /// free blocks before reaching the end marker.
    #[cfg(test)]
    pub(crate) fn free_list_is_consistent(&self) -> bool {
        let mut seen = alloc::vec![false; self.block_count()];
        let mut visited = 0;
        let mut cursor = self.free_list_root;
        while cursor != FREE_LIST_END {
            let index = cursor as usize;
            if index >= self.block_count() || seen[index] || !self.is_block_free(index) {
                return false;
            }
            seen[index] = true;
            visited += 1;
            cursor = self.descriptors[index];
        }
        visited == self.free_count
    }
}
