//! Allocated view: anonymous, lazily-populated memory backed by frames
//! pulled from a physical allocator on first touch.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::collaborators::PhysicalAllocator;
use crate::error::{HelError, HelResult};
use crate::memory::{
    CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights, ResolvedSegment,
    ViewCore, PAGE_SIZE,
};

pub struct AllocatedView {
    core: ViewCore,
    allocator: Arc<dyn PhysicalAllocator>,
    /// One slot per page; `None` until lazily populated.
    pages: Mutex<Vec<Option<PhysicalAddress>>>,
    max_physical_bits: Option<u32>,
}

impl AllocatedView {
    pub fn new(len: usize, cache: CacheMode, allocator: Arc<dyn PhysicalAllocator>) -> HelResult<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(HelError::IllegalArgs);
        }
        let page_count = len / PAGE_SIZE;
        Ok(Self {
            core: ViewCore::new(len, cache),
            allocator,
            pages: Mutex::new(alloc::vec![None; page_count]),
            max_physical_bits: None,
        })
    }

    pub fn with_physical_bound(mut self, bits: u32) -> Self {
        self.max_physical_bits = Some(bits);
        self
    }

    fn populate(&self, page_idx: usize) -> HelResult<PhysicalAddress> {
        let mut pages = self.pages.lock();
        if let Some(existing) = pages[page_idx] {
            return Ok(existing);
        }
        let frame = self.allocator.allocate().ok_or(HelError::NoMemory)?;
        if let Some(bits) = self.max_physical_bits {
            let limit = 1u64 << bits;
            if frame.data() >= limit {
                self.allocator.deallocate(frame);
                return Err(HelError::NoMemory);
            }
        }
        pages[page_idx] = Some(frame);
        Ok(frame)
    }
}

impl MemoryView for AllocatedView {
    fn len(&self) -> usize {
        *self.core.len.lock()
    }

    fn cache_mode(&self) -> CacheMode {
        self.core.cache
    }

    fn allowed_rights(&self) -> Rights {
        Rights::READ | Rights::WRITE | Rights::EXECUTE
    }

    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome> {
        if offset >= self.len() {
            return Ok(FetchOutcome::Fault);
        }
        let page_idx = offset / PAGE_SIZE;
        let physical = self.populate(page_idx)?;
        let page_off = offset % PAGE_SIZE;
        Ok(FetchOutcome::Ready(ResolvedSegment {
            physical: PhysicalAddress::new(physical.data() + page_off as u64),
            len: PAGE_SIZE - page_off,
            cache: self.core.cache,
        }))
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len() {
            return None;
        }
        let page_idx = offset / PAGE_SIZE;
        self.pages.lock()[page_idx].map(|p| (p, self.core.cache))
    }

    fn resize(&self, new_len: usize) -> HelResult<()> {
        if new_len % PAGE_SIZE != 0 {
            return Err(HelError::IllegalArgs);
        }
        let mut len = self.core.len.lock();
        if new_len < *len {
            return Err(HelError::IllegalArgs);
        }
        let mut pages = self.pages.lock();
        pages.resize(new_len / PAGE_SIZE, None);
        *len = new_len;
        Ok(())
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) {
        self.core.add_observer(observer);
    }

    fn remove_observer(&self, observer: &Weak<dyn Observer>) {
        self.core.remove_observer(observer);
    }

    fn notify_evict(&self, offset: usize, len: usize) {
        self.core.notify_evict(offset, len);
    }
}

impl Drop for AllocatedView {
    fn drop(&mut self) {
        for page in self.pages.lock().drain(..).flatten() {
            self.allocator.deallocate(page);
        }
    }
}
