//! Coalescing block metadata
//!
//! Every block in an arena starts with a [`BlockHeader`]; the payload follows
//! at `header + BLOCK_HEADER_SIZE` and the next block's header follows at
//! `payload + size`.

/// Alignment of every header, payload and payload size.
pub const BLOCK_ALIGN: usize = 16;

/// Bytes occupied by a header, padded so payloads stay aligned.
pub const BLOCK_HEADER_SIZE: usize =
    crate::align_up(core::mem::size_of::<BlockHeader>(), BLOCK_ALIGN);

/// Smallest payload a block may carry.
pub const MIN_BLOCK_SIZE: usize = BLOCK_ALIGN;

#[repr(C)]
pub(crate) struct BlockHeader {
    size: usize,
    prev_free: usize,
    next_free: usize,
}

/// Handle to the block whose header lives at `addr`.
///
/// Handles are only built for header addresses inside an arena that the
/// owning page has validated, so the header accessors may dereference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceBlock {
    pub addr: usize,
}

impl CoalesceBlock {
    pub const fn new(addr: usize) -> Self {
        Self { addr }
    }

    pub const fn payload(&self) -> usize {
        self.addr + BLOCK_HEADER_SIZE
    }

    fn header(&self) -> &BlockHeader {
        unsafe { &*(self.addr as *const BlockHeader) }
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        unsafe { &mut *(self.addr as *mut BlockHeader) }
    }

    /// Write a fresh header that is not linked into any free list.
    pub fn init_header(&mut self, size: usize) {
        *self.header_mut() = BlockHeader {
            size,
            prev_free: 0,
            next_free: 0,
        };
    }

    pub fn size(&self) -> usize {
        self.header().size
    }

    pub fn set_size(&mut self, size: usize) {
        self.header_mut().size = size;
    }

    /// Address one past the payload, where the next physical header sits.
    pub fn end(&self) -> usize {
        self.payload() + self.size()
    }

    pub fn prev(&self) -> Option<CoalesceBlock> {
        match self.header().prev_free {
            0 => None,
            addr => Some(CoalesceBlock::new(addr)),
        }
    }

    pub fn next(&self) -> Option<CoalesceBlock> {
        match self.header().next_free {
            0 => None,
            addr => Some(CoalesceBlock::new(addr)),
        }
    }

    pub fn set_prev(&mut self, prev: Option<CoalesceBlock>) {
        self.header_mut().prev_free = prev.map_or(0, |block| block.addr);
    }

    pub fn set_next(&mut self, next: Option<CoalesceBlock>) {
        self.header_mut().next_free = next.map_or(0, |block| block.addr);
    }

    pub fn clear_links(&mut self) {
        self.set_prev(None);
        self.set_next(None);
    }
}
