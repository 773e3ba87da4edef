//! Indirect view: a fixed number of slots, each independently rebindable
//! to another view and range without disturbing the others or requiring
//! callers to re-resolve the indirect view itself.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{HelError, HelResult};
use crate::memory::{CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights, ResolvedSegment};

struct Slot {
    target: Arc<dyn MemoryView>,
    offset: usize,
    len: usize,
}

pub struct IndirectView {
    slots: Mutex<Vec<Slot>>,
    slot_len: usize,
}

impl IndirectView {
    pub fn new(slot_count: usize, slot_len: usize, fallback: Arc<dyn MemoryView>) -> HelResult<Self> {
        if slot_count == 0 || slot_len == 0 {
            return Err(HelError::IllegalArgs);
        }
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(Slot {
                target: fallback.clone(),
                offset: 0,
                len: slot_len,
            });
        }
        Ok(Self {
            slots: Mutex::new(slots),
            slot_len,
        })
    }

    /// Rebind `slot` to `(target, offset, len)`. The new binding is only
    /// visible to lookups that occur after this call returns.
    pub fn rebind(&self, slot: usize, target: Arc<dyn MemoryView>, offset: usize, len: usize) -> HelResult<()> {
        if len > self.slot_len {
            return Err(HelError::IllegalArgs);
        }
        if offset.checked_add(len).ok_or(HelError::IllegalArgs)? > target.len() {
            return Err(HelError::OutOfBounds);
        }
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(slot).ok_or(HelError::OutOfBounds)?;
        entry.target = target;
        entry.offset = offset;
        entry.len = len;
        Ok(())
    }

    fn locate(&self, offset: usize) -> HelResult<(usize, usize)> {
        let slot = offset / self.slot_len;
        let within = offset % self.slot_len;
        Ok((slot, within))
    }
}

impl MemoryView for IndirectView {
    fn len(&self) -> usize {
        self.slots.lock().len() * self.slot_len
    }

    fn cache_mode(&self) -> CacheMode {
        CacheMode::Normal
    }

    fn allowed_rights(&self) -> Rights {
        Rights::READ | Rights::WRITE | Rights::EXECUTE
    }

    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome> {
        if offset >= self.len() {
            return Ok(FetchOutcome::Fault);
        }
        let (slot_idx, within) = self.locate(offset)?;
        let slots = self.slots.lock();
        let slot = &slots[slot_idx];
        if within >= slot.len {
            return Ok(FetchOutcome::Fault);
        }
        let outcome = slot.target.fetch_range(slot.offset + within)?;
        Ok(match outcome {
            FetchOutcome::Ready(segment) => FetchOutcome::Ready(ResolvedSegment {
                physical: segment.physical,
                len: core::cmp::min(segment.len, slot.len - within),
                cache: segment.cache,
            }),
            other => other,
        })
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len() {
            return None;
        }
        let (slot_idx, within) = self.locate(offset).ok()?;
        let slots = self.slots.lock();
        let slot = slots.get(slot_idx)?;
        if within >= slot.len {
            return None;
        }
        slot.target.peek(slot.offset + within)
    }

    fn mark_dirty(&self, offset: usize, len: usize) {
        if let Ok((slot_idx, within)) = self.locate(offset) {
            let slots = self.slots.lock();
            if let Some(slot) = slots.get(slot_idx) {
                slot.target.mark_dirty(slot.offset + within, len);
            }
        }
    }

    fn add_observer(&self, _observer: Weak<dyn Observer>) {}
    fn remove_observer(&self, _observer: &Weak<dyn Observer>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::hardware::HardwareView;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn rebinding_one_slot_does_not_affect_others() {
        let fallback: Arc<dyn MemoryView> =
            Arc::new(HardwareView::new(PhysicalAddress::new(0), PAGE_SIZE, CacheMode::Normal));
        let view = IndirectView::new(2, PAGE_SIZE, fallback).unwrap();

        let target: Arc<dyn MemoryView> =
            Arc::new(HardwareView::new(PhysicalAddress::new(0x9000), PAGE_SIZE, CacheMode::Normal));
        view.rebind(0, target, 0, PAGE_SIZE).unwrap();

        match view.fetch_range(0).unwrap() {
            FetchOutcome::Ready(segment) => assert_eq!(segment.physical.data(), 0x9000),
            _ => panic!("expected ready"),
        }
        match view.fetch_range(PAGE_SIZE).unwrap() {
            FetchOutcome::Ready(segment) => assert_eq!(segment.physical.data(), 0),
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn rebind_rejects_oversized_range() {
        let fallback: Arc<dyn MemoryView> =
            Arc::new(HardwareView::new(PhysicalAddress::new(0), PAGE_SIZE, CacheMode::Normal));
        let view = IndirectView::new(1, PAGE_SIZE, fallback.clone()).unwrap();
        assert!(view.rebind(0, fallback, 0, PAGE_SIZE * 2).is_err());
    }
}
