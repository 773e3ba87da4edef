//! Slice view: a bounded sub-range of a parent view. Never resolves past
//! its own length even when the parent would happily serve more.

use alloc::sync::{Arc, Weak};

use crate::error::{HelError, HelResult};
use crate::memory::{CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights, ResolvedSegment};

pub struct SliceView {
    parent: Arc<dyn MemoryView>,
    offset: usize,
    len: usize,
}

impl SliceView {
    pub fn new(parent: Arc<dyn MemoryView>, offset: usize, len: usize) -> HelResult<Self> {
        if offset.checked_add(len).ok_or(HelError::IllegalArgs)? > parent.len() {
            return Err(HelError::OutOfBounds);
        }
        Ok(Self { parent, offset, len })
    }
}

impl MemoryView for SliceView {
    fn len(&self) -> usize {
        self.len
    }

    fn cache_mode(&self) -> CacheMode {
        self.parent.cache_mode()
    }

    fn allowed_rights(&self) -> Rights {
        self.parent.allowed_rights()
    }

    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome> {
        if offset >= self.len {
            return Ok(FetchOutcome::Fault);
        }
        let outcome = self.parent.fetch_range(self.offset + offset)?;
        Ok(match outcome {
            FetchOutcome::Ready(segment) => FetchOutcome::Ready(ResolvedSegment {
                physical: segment.physical,
                len: core::cmp::min(segment.len, self.len - offset),
                cache: segment.cache,
            }),
            other => other,
        })
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len {
            return None;
        }
        self.parent.peek(self.offset + offset)
    }

    fn mark_dirty(&self, offset: usize, len: usize) {
        self.parent.mark_dirty(self.offset + offset, len);
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) {
        self.parent.add_observer(observer);
    }

    fn remove_observer(&self, observer: &Weak<dyn Observer>) {
        self.parent.remove_observer(observer);
    }

    fn notify_evict(&self, offset: usize, len: usize) {
        self.parent.notify_evict(self.offset + offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestPhysicalAllocator;
    use crate::collaborators::PhysicalAllocator;
    use crate::memory::allocated::AllocatedView;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn slice_never_exceeds_parent() {
        let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let parent: Arc<dyn MemoryView> =
            Arc::new(AllocatedView::new(PAGE_SIZE * 2, CacheMode::Normal, alloc).unwrap());
        assert!(SliceView::new(parent.clone(), PAGE_SIZE, PAGE_SIZE * 2).is_err());
        let slice = SliceView::new(parent, PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(slice.len(), PAGE_SIZE);
    }
}
