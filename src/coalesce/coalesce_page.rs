//! One coalescing arena.
//!
//! The free list is doubly linked, non-circular and kept in address order,
//! so the list predecessor of a free block is also the nearest free block
//! before it in memory.

use core::iter;

#[cfg(feature = "log")]
use log::{error, warn};

use super::coalesce_block::{CoalesceBlock, BLOCK_ALIGN, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::stats::{BlockInfo, BlockState};
use crate::{AllocError, AllocResult};

#[derive(Debug)]
pub struct CoalescePage {
    base: usize,
    arena_size: usize,
    num_pages: usize,
    first_free: Option<CoalesceBlock>,
}

impl CoalescePage {
    /// Lay out a single free block spanning the whole arena at `base`.
    ///
    /// `arena_size` must be a multiple of [`BLOCK_ALIGN`] large enough for one
    /// minimal block, and `base` must be aligned to [`BLOCK_ALIGN`].
    pub fn new(base: usize, arena_size: usize, num_pages: usize) -> Self {
        debug_assert!(crate::is_aligned(base, BLOCK_ALIGN));
        debug_assert!(arena_size >= BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE);

        let mut block = CoalesceBlock::new(base);
        block.init_header(arena_size - BLOCK_HEADER_SIZE);

        Self {
            base,
            arena_size,
            num_pages,
            first_free: Some(block),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn end(&self) -> usize {
        self.base + self.arena_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn first_free(&self) -> Option<CoalesceBlock> {
        self.first_free
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Free-list membership: the head, or any block with a predecessor.
    pub fn is_free(&self, block: CoalesceBlock) -> bool {
        self.first_free == Some(block) || block.prev().is_some()
    }

    /// First-fit allocation of `size` bytes (already rounded to the block
    /// alignment). Returns the payload address, or `None` if no free block of
    /// this arena is large enough.
    pub fn alloc(&mut self, size: usize) -> AllocResult<Option<usize>> {
        let mut cursor = self.checked_head()?;

        while let Some(block) = cursor {
            if block.size() >= size {
                return self.take(block, size).map(Some);
            }
            cursor = self.checked_next(block)?;
        }

        Ok(None)
    }

    /// Release the block whose payload starts at `addr` and merge it with
    /// free neighbours.
    pub fn free(&mut self, addr: usize) -> AllocResult {
        let mut cursor = Some(CoalesceBlock::new(self.base));
        let mut last_free = None;

        let mut block = loop {
            let Some(block) = cursor else {
                warn!(
                    "coalesce page {:#x}: {:#x} is not a block payload",
                    self.base, addr
                );
                return Err(AllocError::InvalidFree);
            };
            if block.payload() == addr {
                break block;
            }
            if block.payload() > addr {
                warn!(
                    "coalesce page {:#x}: {:#x} points into a block",
                    self.base, addr
                );
                return Err(AllocError::InvalidFree);
            }
            if self.is_free(block) {
                last_free = Some(block);
            }
            cursor = self.physical_next(block)?;
        };

        if self.is_free(block) {
            warn!(
                "coalesce page {:#x}: double free of block at {:#x}",
                self.base, addr
            );
            return Err(AllocError::InvalidFree);
        }

        self.insert_after(last_free, block)?;

        if let Some(mut prev) = last_free {
            if prev.end() == block.addr {
                self.unlink(block)?;
                prev.set_size(prev.size() + BLOCK_HEADER_SIZE + block.size());
                block = prev;
            }
        }

        if let Some(next) = block.next() {
            if block.end() == next.addr {
                let absorbed = next.size();
                self.unlink(next)?;
                block.set_size(block.size() + BLOCK_HEADER_SIZE + absorbed);
            }
        }

        Ok(())
    }

    /// Blocks in physical order. Stops early at corrupted metadata.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        iter::successors(Some(CoalesceBlock::new(self.base)), move |&block| {
            self.physical_next(block).ok().flatten()
        })
        .map(move |block| BlockInfo {
            addr: block.payload(),
            size: block.size(),
            state: if self.is_free(block) {
                BlockState::Free
            } else {
                BlockState::Allocated
            },
        })
    }

    /// Hand out `block`, splitting off the surplus when it can hold a block.
    fn take(&mut self, mut block: CoalesceBlock, size: usize) -> AllocResult<usize> {
        let surplus = block.size() - size;

        if surplus >= BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE {
            let (prev, next) = self.neighbours(block)?;

            let mut rest = CoalesceBlock::new(block.payload() + size);
            rest.init_header(surplus - BLOCK_HEADER_SIZE);
            rest.set_prev(prev);
            rest.set_next(next);
            match prev {
                Some(mut prev) => prev.set_next(Some(rest)),
                None => self.first_free = Some(rest),
            }
            if let Some(mut next) = next {
                next.set_prev(Some(rest));
            }

            block.set_size(size);
            block.clear_links();
        } else {
            self.unlink(block)?;
        }

        Ok(block.payload())
    }

    /// Link the allocated `block` into the free list right after `prev`.
    fn insert_after(
        &mut self,
        prev: Option<CoalesceBlock>,
        mut block: CoalesceBlock,
    ) -> AllocResult {
        let next = match prev {
            Some(prev) => self.neighbours(prev)?.1,
            None => self.checked_head()?,
        };
        if next.is_some_and(|next| next.addr <= block.addr) {
            return Err(self.broken_link(block));
        }

        block.set_prev(prev);
        block.set_next(next);
        match prev {
            Some(mut prev) => prev.set_next(Some(block)),
            None => self.first_free = Some(block),
        }
        if let Some(mut next) = next {
            next.set_prev(Some(block));
        }
        Ok(())
    }

    fn unlink(&mut self, mut block: CoalesceBlock) -> AllocResult {
        let (prev, next) = self.neighbours(block)?;

        match prev {
            Some(mut prev) => prev.set_next(next),
            None => self.first_free = next,
        }
        if let Some(mut next) = next {
            next.set_prev(prev);
        }

        block.clear_links();
        Ok(())
    }

    /// Both free-list neighbours of the free `block`, each checked to lie in
    /// the arena, on the correct side and to link back to `block`.
    fn neighbours(
        &self,
        block: CoalesceBlock,
    ) -> AllocResult<(Option<CoalesceBlock>, Option<CoalesceBlock>)> {
        let prev = block.prev();
        let linked = match prev {
            Some(prev) => {
                self.holds_header(prev.addr)
                    && prev.addr < block.addr
                    && prev.next() == Some(block)
            }
            None => self.first_free == Some(block),
        };
        if !linked {
            return Err(self.broken_link(block));
        }
        Ok((prev, self.checked_next(block)?))
    }

    fn checked_head(&self) -> AllocResult<Option<CoalesceBlock>> {
        match self.first_free {
            Some(head) if !self.holds_header(head.addr) || head.prev().is_some() => {
                Err(self.broken_link(head))
            }
            head => Ok(head),
        }
    }

    /// The free-list successor of `block`. Successors strictly increase in
    /// address, which also bounds every walk of the list.
    fn checked_next(&self, block: CoalesceBlock) -> AllocResult<Option<CoalesceBlock>> {
        match block.next() {
            Some(next)
                if !self.holds_header(next.addr)
                    || next.addr <= block.addr
                    || next.prev() != Some(block) =>
            {
                Err(self.broken_link(block))
            }
            next => Ok(next),
        }
    }

    fn broken_link(&self, block: CoalesceBlock) -> AllocError {
        error!(
            "coalesce page {:#x}: broken free-list link at {:#x}",
            self.base, block.addr
        );
        AllocError::Corruption
    }

    /// The block physically after `block`, or `None` at the arena end.
    fn physical_next(&self, block: CoalesceBlock) -> AllocResult<Option<CoalesceBlock>> {
        let size = block.size();
        let next = block
            .payload()
            .checked_add(size)
            .filter(|&next| size % BLOCK_ALIGN == 0 && next <= self.end());

        match next {
            Some(next) if next == self.end() => Ok(None),
            Some(next) if self.holds_header(next) => Ok(Some(CoalesceBlock::new(next))),
            _ => {
                error!(
                    "coalesce page {:#x}: block at {:#x} has invalid size {}",
                    self.base, block.addr, size
                );
                Err(AllocError::Corruption)
            }
        }
    }

    /// Whether a header plus a minimal payload fits at `addr`.
    fn holds_header(&self, addr: usize) -> bool {
        addr >= self.base
            && crate::is_aligned(addr, BLOCK_ALIGN)
            && self.end() - addr.min(self.end()) >= BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, dealloc};
    use alloc::vec::Vec;
    use core::alloc::Layout;

    const ARENA: usize = 4096;

    struct TestArena {
        base: usize,
        layout: Layout,
    }

    impl TestArena {
        fn new() -> Self {
            let layout = Layout::from_size_align(ARENA, ARENA).unwrap();
            let base = unsafe { alloc(layout) } as usize;
            assert_ne!(base, 0);
            Self { base, layout }
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { dealloc(self.base as *mut u8, self.layout) };
        }
    }

    fn free_sizes(page: &CoalescePage) -> Vec<usize> {
        page.blocks()
            .filter(|block| block.state == BlockState::Free)
            .map(|block| block.size)
            .collect()
    }

    #[test]
    fn test_page_init() {
        let arena = TestArena::new();
        let page = CoalescePage::new(arena.base, ARENA, 1);

        let blocks: Vec<_> = page.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, ARENA - BLOCK_HEADER_SIZE);
        assert_eq!(blocks[0].state, BlockState::Free);
    }

    #[test]
    fn test_split_on_alloc() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        assert_eq!(a, arena.base + BLOCK_HEADER_SIZE);

        let blocks: Vec<_> = page.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].state, BlockState::Allocated);
        assert_eq!(blocks[0].size, 64);
        assert_eq!(blocks[1].addr, a + 64 + BLOCK_HEADER_SIZE);
        assert_eq!(blocks[1].size, ARENA - 2 * BLOCK_HEADER_SIZE - 64);
        assert_eq!(page.first_free().map(|b| b.payload()), Some(blocks[1].addr));
    }

    #[test]
    fn test_exact_fit_unlinks() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let whole = ARENA - BLOCK_HEADER_SIZE;
        let a = page.alloc(whole).unwrap().unwrap();
        assert_eq!(page.first_free(), None);
        assert_eq!(page.alloc(16).unwrap(), None);

        page.free(a).unwrap();
        assert_eq!(free_sizes(&page), [whole]);
    }

    #[test]
    fn test_small_surplus_not_split() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        // Leaves less than a header plus a minimal payload behind
        let size = ARENA - 2 * BLOCK_HEADER_SIZE;
        let a = page.alloc(size).unwrap().unwrap();
        let blocks: Vec<_> = page.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].addr, a);
        assert_eq!(blocks[0].size, ARENA - BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_merge_adjacent_either_order() {
        for reverse in [false, true] {
            let arena = TestArena::new();
            let mut page = CoalescePage::new(arena.base, ARENA, 1);

            let a = page.alloc(64).unwrap().unwrap();
            let b = page.alloc(128).unwrap().unwrap();
            // Keeps the tail from merging with a and b
            let _guard = page.alloc(32).unwrap().unwrap();

            let (first, second) = if reverse { (b, a) } else { (a, b) };
            page.free(first).unwrap();
            page.free(second).unwrap();

            let freed: Vec<_> = page
                .blocks()
                .filter(|block| block.state == BlockState::Free && block.addr == a)
                .collect();
            assert_eq!(freed.len(), 1);
            assert_eq!(freed[0].size, 64 + 128 + BLOCK_HEADER_SIZE);
        }
    }

    #[test]
    fn test_merge_both_sides() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        let b = page.alloc(64).unwrap().unwrap();
        let c = page.alloc(64).unwrap().unwrap();

        page.free(a).unwrap();
        page.free(c).unwrap();
        assert_eq!(free_sizes(&page).len(), 2);

        // b bridges a and the tail (c already merged into the tail)
        page.free(b).unwrap();
        assert_eq!(free_sizes(&page), [ARENA - BLOCK_HEADER_SIZE]);
    }

    #[test]
    fn test_free_list_stays_address_ordered() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let ptrs: Vec<_> = (0..8).map(|_| page.alloc(32).unwrap().unwrap()).collect();
        for &index in &[5, 1, 3, 7] {
            page.free(ptrs[index]).unwrap();
        }

        let mut cursor = page.first_free();
        let mut last = 0;
        let mut count = 0;
        while let Some(block) = cursor {
            assert!(block.addr > last);
            if let Some(prev) = block.prev() {
                assert_eq!(prev.next(), Some(block));
            }
            last = block.addr;
            count += 1;
            cursor = block.next();
        }
        // 1, 3, 5 and 7, the last one merged with the tail
        assert_eq!(count, 4);
    }

    #[test]
    fn test_invalid_frees() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        assert_eq!(page.free(a + 16), Err(AllocError::InvalidFree));
        assert_eq!(page.free(arena.base), Err(AllocError::InvalidFree));

        page.free(a).unwrap();
        assert_eq!(page.free(a), Err(AllocError::InvalidFree));
    }

    #[test]
    fn test_corrupted_size_detected() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        let b = page.alloc(64).unwrap().unwrap();

        let mut first = CoalesceBlock::new(a - BLOCK_HEADER_SIZE);
        first.set_size(ARENA * 4);
        assert_eq!(page.free(b), Err(AllocError::Corruption));

        first.set_size(64 + 8);
        assert_eq!(page.free(b), Err(AllocError::Corruption));
    }

    /// Header-sized scratch memory that lives outside every arena.
    #[repr(C, align(16))]
    struct Outside([usize; 8]);

    impl Outside {
        fn block(&self) -> CoalesceBlock {
            CoalesceBlock::new(self.0.as_ptr() as usize)
        }
    }

    #[test]
    fn test_broken_next_link_on_free_detected() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);
        let outside = Outside([0; 8]);

        let a = page.alloc(64).unwrap().unwrap();
        let _b = page.alloc(64).unwrap().unwrap();
        let c = page.alloc(64).unwrap().unwrap();
        page.free(a).unwrap();

        let mut first = CoalesceBlock::new(a - BLOCK_HEADER_SIZE);
        first.set_next(Some(outside.block()));
        assert_eq!(page.free(c), Err(AllocError::Corruption));
        assert_eq!(outside.0, [0; 8]);
    }

    #[test]
    fn test_missing_back_link_on_free_detected() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        let b = page.alloc(64).unwrap().unwrap();
        let c = page.alloc(64).unwrap().unwrap();
        page.free(a).unwrap();
        page.free(c).unwrap();

        // The tail merged into c, whose header links back to a
        let mut tail = CoalesceBlock::new(c - BLOCK_HEADER_SIZE);
        assert_eq!(tail.prev(), Some(CoalesceBlock::new(a - BLOCK_HEADER_SIZE)));
        tail.set_prev(Some(CoalesceBlock::new(b - BLOCK_HEADER_SIZE)));
        assert_eq!(page.free(b), Err(AllocError::Corruption));
    }

    #[test]
    fn test_broken_next_link_on_alloc_detected() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);
        let outside = Outside([0; 8]);

        let a = page.alloc(64).unwrap().unwrap();
        let b = page.alloc(64).unwrap().unwrap();
        page.free(a).unwrap();

        let mut first = CoalesceBlock::new(a - BLOCK_HEADER_SIZE);
        first.set_next(Some(outside.block()));
        assert_eq!(page.alloc(1024), Err(AllocError::Corruption));
        assert_eq!(outside.0, [0; 8]);

        // In the arena but never linked back
        first.set_next(Some(CoalesceBlock::new(b - BLOCK_HEADER_SIZE)));
        assert_eq!(page.alloc(1024), Err(AllocError::Corruption));
    }

    #[test]
    fn test_broken_head_on_alloc_detected() {
        let arena = TestArena::new();
        let mut page = CoalescePage::new(arena.base, ARENA, 1);

        let a = page.alloc(64).unwrap().unwrap();
        let mut tail = page.first_free().unwrap();
        tail.set_prev(Some(CoalesceBlock::new(a - BLOCK_HEADER_SIZE)));
        assert_eq!(page.alloc(32), Err(AllocError::Corruption));
    }
}
