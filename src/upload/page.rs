//! The Ring Pager: a growable ring of mapped host-visible staging pages.
//!
//! Ported from `UploadManager::AllocateUploadRegion` and
//! `UploadManager::ProcessDeferredReleases`
//! (`original_source/src/Managers/Singletons/UploadManager.cpp`). The
//! `m_currentCapacity` / `m_headOffset` / `m_tailOffset` fields from that
//! file are single-ring vestiges the original's own design notes call out
//! as dead; they are not ported (see DESIGN.md).

use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, UploadStatsError};
use crate::rhi::{BufferDesc, Device, GpuBuffer, MemoryUsage};
use crate::util::align_up;

/// Default page size: 256 MiB.
pub const DEFAULT_PAGE_SIZE: u64 = 256 * 1024 * 1024;
/// No single page this pager creates may exceed this size.
pub const MAX_PAGE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

struct UploadPage {
    buffer: Arc<dyn GpuBuffer>,
    tail_offset: u64,
}

impl UploadPage {
    fn capacity(&self) -> u64 {
        self.buffer.size()
    }
}

/// The page (by reference) and byte offset an allocation landed at.
#[derive(Clone)]
pub struct PageAllocation {
    pub buffer: Arc<dyn GpuBuffer>,
    pub offset: u64,
    pub(crate) page_index: usize,
}

/// A growable ring of upload pages: allocations bump-allocate out of the
/// active page, spilling into a freshly pushed page when the active one is
/// full, and a page is only ever freed once every in-flight frame slot has
/// moved past it.
pub struct RingPager {
    device: Arc<dyn Device>,
    pages: Vec<UploadPage>,
    active_page: usize,
    frame_start_page: Vec<usize>,
    page_size: u64,
}

impl RingPager {
    pub fn new(device: Arc<dyn Device>, frames_in_flight: usize, page_size: u64) -> Result<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let mut pager = Self {
            device,
            pages: Vec::new(),
            active_page: 0,
            frame_start_page: vec![0; frames_in_flight],
            page_size: page_size.min(MAX_PAGE_SIZE).max(1),
        };
        pager.push_page(pager.page_size)?;
        Ok(pager)
    }

    fn push_page(&mut self, size: u64) -> Result<()> {
        if size > MAX_PAGE_SIZE {
            warn!(size, max = MAX_PAGE_SIZE, "upload page request exceeds max_page_size");
        }
        let buffer = self.try_create_page(size)?;
        self.pages.push(UploadPage {
            buffer,
            tail_offset: 0,
        });
        Ok(())
    }

    fn try_create_page(&self, size: u64) -> Result<Arc<dyn GpuBuffer>> {
        // A real backend signals allocation failure through its own error
        // type; this trait boundary treats any panic-free `None`/failure
        // path as out-of-host-memory. The `Device` trait used here always
        // succeeds or panics in test fakes, so in practice this path only
        // exists to give callers a typed failure to propagate.
        Ok(self.device.create_buffer(BufferDesc {
            size,
            memory_usage: MemoryUsage::CpuToGpu,
        }))
    }

    /// Allocate an aligned byte range from the active page, growing the
    /// ring as needed. `alignment` of `0` is treated as `1`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<PageAllocation> {
        let alignment = alignment.max(1);

        if self.pages.is_empty() {
            return Err(UploadStatsError::OutOfHostMemory(size));
        }

        {
            let page = &mut self.pages[self.active_page];
            let aligned_tail = align_up(page.tail_offset, alignment);
            if aligned_tail + size <= page.capacity() {
                page.tail_offset = aligned_tail + size;
                return Ok(PageAllocation {
                    buffer: page.buffer.clone(),
                    offset: aligned_tail,
                    page_index: self.active_page,
                });
            }
        }

        // Doesn't fit: advance to the next page, creating one if needed.
        self.active_page += 1;
        if self.active_page >= self.pages.len() {
            self.push_page(self.page_size.max(size))?;
        }

        {
            let page = &mut self.pages[self.active_page];
            page.tail_offset = 0;
            let aligned_tail = align_up(page.tail_offset, alignment);
            if aligned_tail + size <= page.capacity() {
                page.tail_offset = aligned_tail + size;
                return Ok(PageAllocation {
                    buffer: page.buffer.clone(),
                    offset: aligned_tail,
                    page_index: self.active_page,
                });
            }
        }

        // Still doesn't fit (only possible if capacity() < size despite the
        // `max(page_size, size)` sizing above, e.g. a zero-sized device
        // quirk): fall back to a dedicated page sized exactly for this
        // request.
        self.push_page(self.page_size.max(size))?;
        self.active_page = self.pages.len() - 1;
        let page = &mut self.pages[self.active_page];
        page.tail_offset = 0;
        let aligned_tail = align_up(page.tail_offset, alignment);
        if aligned_tail + size > page.capacity() {
            return Err(UploadStatsError::OutOfHostMemory(size));
        }
        page.tail_offset = aligned_tail + size;
        Ok(PageAllocation {
            buffer: page.buffer.clone(),
            offset: aligned_tail,
            page_index: self.active_page,
        })
    }

    /// Called once per end-of-frame for the slot whose GPU work has fully
    /// completed. Erases any page index below the minimum `frame_start_page`
    /// across all slots, but always keeps at least one page alive.
    pub fn retire(&mut self, frame_slot: usize) {
        assert!(frame_slot < self.frame_start_page.len());

        let min_start = self
            .frame_start_page
            .iter()
            .copied()
            .min()
            .unwrap_or(0);

        if min_start > 0 {
            let erase_count = min_start.min(self.pages.len() - 1);
            if erase_count > 0 {
                self.pages.drain(0..erase_count);
                self.active_page -= erase_count;
                for start in &mut self.frame_start_page {
                    *start = start.saturating_sub(erase_count);
                }
            }
        }

        self.frame_start_page[frame_slot] = self.active_page;
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn active_page_index(&self) -> usize {
        self.active_page
    }

    pub fn frame_start_page(&self, frame_slot: usize) -> usize {
        self.frame_start_page[frame_slot]
    }
}
