//! Hardware view: fixed physical base + length, no paging. Used for MMIO
//! apertures and other device-backed ranges that are never swapped.

use alloc::sync::Weak;

use crate::error::HelResult;
use crate::memory::{CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights, ResolvedSegment, ViewCore, PAGE_SIZE};

pub struct HardwareView {
    core: ViewCore,
    base: PhysicalAddress,
}

impl HardwareView {
    pub fn new(base: PhysicalAddress, len: usize, cache: CacheMode) -> Self {
        Self {
            core: ViewCore::new(len, cache),
            base,
        }
    }
}

impl MemoryView for HardwareView {
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
        let page_off = offset & !(PAGE_SIZE - 1);
        let len = core::cmp::min(PAGE_SIZE, self.len() - page_off);
        Ok(FetchOutcome::Ready(ResolvedSegment {
            physical: PhysicalAddress::new(self.base.data() + page_off as u64),
            len,
            cache: self.core.cache,
        }))
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len() {
            return None;
        }
        let page_off = offset & !(PAGE_SIZE - 1);
        Some((
            PhysicalAddress::new(self.base.data() + page_off as u64),
            self.core.cache,
        ))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_within_bounds() {
        let view = HardwareView::new(PhysicalAddress::new(0x1000), PAGE_SIZE * 2, CacheMode::Normal);
        match view.fetch_range(10).unwrap() {
            FetchOutcome::Ready(segment) => assert_eq!(segment.physical.data(), 0x1000),
            _ => panic!("expected ready"),
        }
        match view.fetch_range(PAGE_SIZE * 2).unwrap() {
            FetchOutcome::Fault => {}
            _ => panic!("expected fault past end"),
        }
    }
}
