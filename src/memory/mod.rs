//! Memory view hierarchy.
//!
//! A single `MemoryView` trait is the uniform dispatch point, with
//! `hardware`/`allocated`/`managed`/`slice`/`cow`/`indirect` submodules each
//! providing one concrete implementation.

pub mod allocated;
pub mod cow;
pub mod hardware;
pub mod indirect;
pub mod managed;
pub mod slice;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{HelError, HelResult};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & PAGE_MASK == 0
}

#[inline]
pub const fn align_down(value: usize) -> usize {
    value & !PAGE_MASK
}

#[inline]
pub const fn align_up(value: usize) -> usize {
    (value + PAGE_MASK) & !PAGE_MASK
}

/// Opaque physical page address, as handed out by a `PhysicalAllocator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
    pub const fn data(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Normal,
    WriteCombining,
    Uncached,
}

bitflags::bitflags! {
    /// Rights a mapping may request; also the rights a view allows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Result of resolving a physical segment for `[offset, offset + len)`.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSegment {
    pub physical: PhysicalAddress,
    pub len: usize,
    pub cache: CacheMode,
}

/// Outcome of an asynchronous `fetchRange`/`lockRange` style operation.
/// Suspension points in this crate never block a real OS thread — the
/// thread itself need not block while a page is serviced — so a pending
/// fetch is represented explicitly instead of via an executor.
#[derive(Debug)]
pub enum FetchOutcome {
    Ready(ResolvedSegment),
    /// Caller must retry after the view reports progress (see
    /// `ManagedView::drain_ready`), keyed by a small opaque waiter id.
    Pending(u64),
    Fault,
}

/// A party registered with a view to be notified before a page becomes
/// invalid as part of the eviction protocol.
pub trait Observer: Send + Sync {
    /// Called before backing memory for `[offset, offset+len)` becomes
    /// invalid. Returns `true` once the observer is done (e.g. has torn
    /// down its mapping); the evict driver waits for every observer to
    /// answer `true` before returning the frame to the allocator.
    fn on_evict(&self, offset: usize, len: usize) -> bool;
}

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);
pub(crate) fn next_waiter_id() -> u64 {
    NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Common bookkeeping shared by every view: length, cache mode, and the
/// observer list notified on eviction.
pub struct ViewCore {
    pub len: Mutex<usize>,
    pub cache: CacheMode,
    observers: Mutex<Vec<Weak<dyn Observer>>>,
}

impl ViewCore {
    pub fn new(len: usize, cache: CacheMode) -> Self {
        Self {
            len: Mutex::new(len),
            cache,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Weak<dyn Observer>) {
        self.observers.lock().push(observer);
    }

    pub fn remove_observer(&self, observer: &Weak<dyn Observer>) {
        self.observers
            .lock()
            .retain(|o| !Weak::ptr_eq(o, observer));
    }

    /// Notify every live observer of an eviction, waiting for each to
    /// confirm completion before returning.
    pub fn notify_evict(&self, offset: usize, len: usize) {
        let observers = self.observers.lock();
        for observer in observers.iter() {
            if let Some(observer) = observer.upgrade() {
                while !observer.on_evict(offset, len) {
                    core::hint::spin_loop();
                }
            }
        }
    }
}

/// Uniform capability set every view variant publishes.
pub trait MemoryView: Send + Sync {
    fn len(&self) -> usize;
    fn cache_mode(&self) -> CacheMode;
    fn allowed_rights(&self) -> Rights;

    /// Resolve a physical segment starting at `offset`. The returned
    /// segment never straddles a page and never exceeds the view's length.
    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome>;

    /// Peek a page without triggering population; `None` if not resident.
    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)>;

    /// Grow the view; only allocated/managed views support this. Views
    /// never shrink — length only ever grows through `resize`.
    fn resize(&self, _new_len: usize) -> HelResult<()> {
        Err(HelError::UnsupportedOperation)
    }

    fn mark_dirty(&self, _offset: usize, _len: usize) {}

    fn add_observer(&self, _observer: Weak<dyn Observer>) {}
    fn remove_observer(&self, _observer: &Weak<dyn Observer>) {}

    /// Drive the eviction protocol for `[offset, offset+len)`: every
    /// registered observer is asked to tear down before this returns. Views
    /// with no eviction concept (`CowView`, `IndirectView`) leave this a
    /// no-op.
    fn notify_evict(&self, _offset: usize, _len: usize) {}
}

/// A pin preventing eviction over `[offset, offset+len)`. Dropping releases
/// the pin.
pub struct LockHandle {
    view: Arc<dyn MemoryView>,
    offset: usize,
    len: usize,
}

impl LockHandle {
    pub fn new(view: Arc<dyn MemoryView>, offset: usize, len: usize) -> Self {
        Self { view, offset, len }
    }
    pub fn range(&self) -> (usize, usize) {
        (self.offset, self.len)
    }
    pub fn view(&self) -> &Arc<dyn MemoryView> {
        &self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_helpers() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE));
        assert!(!is_page_aligned(1));
        assert_eq!(align_down(PAGE_SIZE + 1), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE + 1), PAGE_SIZE * 2);
    }

    #[test]
    fn rights_subset_lattice() {
        let rw = Rights::READ | Rights::WRITE;
        assert!(rw.contains(Rights::READ));
        assert!(!Rights::READ.contains(Rights::WRITE));
        assert_eq!((rw & Rights::READ), Rights::READ);
    }
}
