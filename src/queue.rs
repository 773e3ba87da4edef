//! Completion queue: a fixed power-of-two ring of completion records plus a
//! chunk arena, and the cancellation registry long-running ops register
//! with.
//!
//! CAS-claimed producer slots published with `Ordering::Release`, with a
//! futex-style consumer wakeup, generalized from a fixed submission/
//! completion entry pair to a variable-sized, chunked completion payload.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{HelError, HelResult};

pub const CHUNK_SIZE: usize = 128;

/// One completion record: a user-provided 64-bit context and a payload that
/// never straddles a chunk boundary.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub async_id: u64,
    pub context: u64,
    pub payload: Vec<u8>,
}

struct Slot {
    claimed: AtomicBool,
    published: AtomicBool,
    record: Mutex<Option<CompletionRecord>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            published: AtomicBool::new(false),
            record: Mutex::new(None),
        }
    }
}

/// A long-running operation registers a `Cancellable` so `cancel_async` can
/// ask it to wind down instead of silently vanishing.
pub trait Cancellable: Send + Sync {
    fn handle_cancellation(&self);
}

pub struct CompletionQueue {
    slots: Vec<Slot>,
    mask: u64,
    tail: AtomicU64,
    head: AtomicU64,
    next_async_id: AtomicU64,
    /// Keyed by an opaque async id with no ordering requirement, unlike the
    /// address-ordered `BTreeMap` mapping table in `address_space.rs`.
    registry: Mutex<HashMap<u64, Box<dyn Cancellable>>>,
    chunks_per_record: usize,
}

impl CompletionQueue {
    /// `capacity` must be a power of two; `chunks_per_record` bounds how
    /// many `CHUNK_SIZE` chunks a single record's payload may span.
    pub fn new(capacity: usize, chunks_per_record: usize) -> HelResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(HelError::IllegalArgs);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            next_async_id: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
            chunks_per_record,
        })
    }

    pub fn alloc_async_id(&self) -> u64 {
        self.next_async_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_cancellable(&self, async_id: u64, node: Box<dyn Cancellable>) {
        self.registry.lock().insert(async_id, node);
    }

    /// True if a record carrying `len` payload bytes fits within the chunk
    /// budget for a single record.
    pub fn valid_size(&self, len: usize) -> bool {
        len <= self.chunks_per_record * CHUNK_SIZE
    }

    /// Claim the next slot by CAS-style fetch-add on the tail counter,
    /// write the record, then publish with `Release` so a consumer
    /// observing `published` is guaranteed to see the record contents.
    pub fn submit(&self, async_id: u64, context: u64, payload: Vec<u8>) -> HelResult<()> {
        if !self.valid_size(payload.len()) {
            return Err(HelError::BufferTooSmall);
        }
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        let idx = (ticket & self.mask) as usize;
        let slot = &self.slots[idx];
        if slot.claimed.swap(true, Ordering::AcqRel) {
            return Err(HelError::QueueTooSmall);
        }
        *slot.record.lock() = Some(CompletionRecord {
            async_id,
            context,
            payload,
        });
        slot.published.store(true, Ordering::Release);
        self.registry.lock().remove(&async_id);
        Ok(())
    }

    /// Drain every published record in FIFO order, resetting the
    /// corresponding slots for reuse. Stands in for the user-space consumer
    /// reading the ring and advancing its head.
    pub fn drain(&self) -> Vec<CompletionRecord> {
        let mut out = Vec::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            if head >= self.tail.load(Ordering::Acquire) {
                break;
            }
            let idx = (head & self.mask) as usize;
            let slot = &self.slots[idx];
            if !slot.published.load(Ordering::Acquire) {
                break;
            }
            if let Some(record) = slot.record.lock().take() {
                out.push(record);
            }
            slot.published.store(false, Ordering::Relaxed);
            slot.claimed.store(false, Ordering::Relaxed);
            self.head.store(head + 1, Ordering::Release);
        }
        out
    }

    /// `helCancelAsync`: look the id up and invoke its cancellation hook.
    /// Cancelling an id that already completed (or never existed) is a
    /// legal no-op.
    pub fn cancel_async(&self, async_id: u64) -> HelResult<()> {
        let node = self.registry.lock().remove(&async_id);
        if let Some(node) = node {
            node.handle_cancellation();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use spin::Mutex as SpinMutex;

    struct RecordingCancellable(Arc<SpinMutex<bool>>);
    impl Cancellable for RecordingCancellable {
        fn handle_cancellation(&self) {
            *self.0.lock() = true;
        }
    }

    #[test]
    fn submit_then_drain_round_trip() {
        let queue = CompletionQueue::new(4, 1).unwrap();
        let id = queue.alloc_async_id();
        queue.submit(id, 0xAB, alloc::vec![1, 2, 3]).unwrap();
        let records = queue.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].context, 0xAB);
        assert_eq!(records[0].payload, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn cancel_already_completed_is_noop() {
        let queue = CompletionQueue::new(4, 1).unwrap();
        let id = queue.alloc_async_id();
        let cancelled = Arc::new(SpinMutex::new(false));
        queue.register_cancellable(id, Box::new(RecordingCancellable(cancelled.clone())));
        queue.submit(id, 0, Vec::new()).unwrap();
        assert!(queue.cancel_async(id).is_ok());
        assert!(!*cancelled.lock());
    }

    #[test]
    fn cancel_pending_invokes_hook() {
        let queue = CompletionQueue::new(4, 1).unwrap();
        let id = queue.alloc_async_id();
        let cancelled = Arc::new(SpinMutex::new(false));
        queue.register_cancellable(id, Box::new(RecordingCancellable(cancelled.clone())));
        queue.cancel_async(id).unwrap();
        assert!(*cancelled.lock());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let queue = CompletionQueue::new(4, 1).unwrap();
        let id = queue.alloc_async_id();
        let payload = alloc::vec![0u8; CHUNK_SIZE + 1];
        assert!(queue.submit(id, 0, payload).is_err());
    }
}
