//! Page sources backing the allocators.
//!
//! Every byte handed out by the pools, the coalescing arenas and the
//! oversized path is carved out of page runs obtained from a [`PageSource`].

use core::alloc::Layout;

#[cfg(feature = "log")]
use log::{debug, error};

use crate::{AllocError, AllocResult, DEFAULT_PAGE_SIZE};

/// Supplier of OS-backed page runs.
///
/// Runs are returned as base addresses aligned to [`PageSource::page_size`]
/// and are readable and writable until passed back to `dealloc_pages`.
pub trait PageSource {
    /// The size of a memory page.
    fn page_size(&self) -> usize;

    /// Reserve and commit `num_pages` contiguous pages.
    fn alloc_pages(&mut self, num_pages: usize) -> AllocResult<usize>;

    /// Release a run previously returned by `alloc_pages` with the same count.
    fn dealloc_pages(&mut self, pos: usize, num_pages: usize);

    /// Returns the number of pages currently reserved from this source.
    fn reserved_pages(&self) -> usize;

    /// Number of pages needed to hold `bytes`.
    fn pages_for(&self, bytes: usize) -> AllocResult<usize> {
        let page_size = self.page_size();
        bytes
            .checked_add(page_size - 1)
            .map(|rounded| (rounded / page_size).max(1))
            .ok_or(AllocError::InvalidParam)
    }
}

/// Page source built on anonymous private `mmap` mappings.
#[cfg(unix)]
pub struct MmapPageSource {
    page_size: usize,
    reserved_pages: usize,
}

#[cfg(unix)]
impl MmapPageSource {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if reported > 0 && (reported as usize).is_power_of_two() {
            reported as usize
        } else {
            DEFAULT_PAGE_SIZE
        };
        Self {
            page_size,
            reserved_pages: 0,
        }
    }
}

#[cfg(unix)]
impl Default for MmapPageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl PageSource for MmapPageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_pages(&mut self, num_pages: usize) -> AllocResult<usize> {
        if num_pages == 0 {
            return Err(AllocError::InvalidParam);
        }
        let len = num_pages
            .checked_mul(self.page_size)
            .ok_or(AllocError::InvalidParam)?;

        // SAFETY: anonymous mapping with no fd and no fixed address.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED || ptr.is_null() {
            error!("mmap page source: failed to map {} pages", num_pages);
            return Err(AllocError::OutOfMemory);
        }

        self.reserved_pages += num_pages;
        debug!(
            "mmap page source: mapped {} pages at {:#x}",
            num_pages, ptr as usize
        );
        Ok(ptr as usize)
    }

    fn dealloc_pages(&mut self, pos: usize, num_pages: usize) {
        let len = num_pages * self.page_size;
        // SAFETY: the run was mapped by alloc_pages with the same length.
        let ret = unsafe { libc::munmap(pos as *mut libc::c_void, len) };
        if ret != 0 {
            error!(
                "mmap page source: munmap of {} pages at {:#x} failed",
                num_pages, pos
            );
            return;
        }
        self.reserved_pages = self.reserved_pages.saturating_sub(num_pages);
    }

    fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }
}

/// Page source carving page-aligned runs out of the global heap.
///
/// An optional page budget makes reservation fail with
/// [`AllocError::OutOfMemory`] once exhausted.
pub struct HeapPageSource {
    page_limit: Option<usize>,
    reserved_pages: usize,
}

impl HeapPageSource {
    pub const fn new() -> Self {
        Self {
            page_limit: None,
            reserved_pages: 0,
        }
    }

    /// A source that refuses to hold more than `max_pages` pages at once.
    pub const fn with_page_limit(max_pages: usize) -> Self {
        Self {
            page_limit: Some(max_pages),
            reserved_pages: 0,
        }
    }

    fn layout(num_pages: usize) -> AllocResult<Layout> {
        let size = num_pages
            .checked_mul(DEFAULT_PAGE_SIZE)
            .ok_or(AllocError::InvalidParam)?;
        Layout::from_size_align(size, DEFAULT_PAGE_SIZE).map_err(|_| AllocError::InvalidParam)
    }
}

impl Default for HeapPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for HeapPageSource {
    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    fn alloc_pages(&mut self, num_pages: usize) -> AllocResult<usize> {
        if num_pages == 0 {
            return Err(AllocError::InvalidParam);
        }
        if let Some(limit) = self.page_limit {
            if self.reserved_pages + num_pages > limit {
                error!(
                    "heap page source: budget of {} pages exhausted ({} reserved, {} requested)",
                    limit, self.reserved_pages, num_pages
                );
                return Err(AllocError::OutOfMemory);
            }
        }

        let layout = Self::layout(num_pages)?;
        // SAFETY: layout has a non-zero size.
        let addr = unsafe { alloc::alloc::alloc(layout) } as usize;
        if addr == 0 {
            error!("heap page source: failed to allocate {} pages", num_pages);
            return Err(AllocError::OutOfMemory);
        }

        self.reserved_pages += num_pages;
        Ok(addr)
    }

    fn dealloc_pages(&mut self, pos: usize, num_pages: usize) {
        let Ok(layout) = Self::layout(num_pages) else {
            return;
        };
        // SAFETY: the run was allocated by alloc_pages with the same layout.
        unsafe { alloc::alloc::dealloc(pos as *mut u8, layout) };
        self.reserved_pages = self.reserved_pages.saturating_sub(num_pages);
    }

    fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }
}

/// The page source used by [`crate::MemoryAllocator::new`].
#[cfg(unix)]
pub type DefaultPageSource = MmapPageSource;

/// The page source used by [`crate::MemoryAllocator::new`].
#[cfg(not(unix))]
pub type DefaultPageSource = HeapPageSource;
