//! Managed (pageable) view and its page-load protocol.
//!
//! Page states: `missing -> wantInit -> initializing -> present`, and on the
//! writeback side `present -> wantWriteback -> writingback ->
//! (writingbackAgain?) -> present`, plus an `evicting` state driven by the
//! reclaim layer.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::collaborators::PhysicalAllocator;
use crate::error::{HelError, HelResult};
use crate::memory::{
    next_waiter_id, CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights,
    ResolvedSegment, ViewCore, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Missing,
    Present,
    WantInit,
    Initializing,
    WantWriteback,
    Writingback,
    WritingbackAgain,
    Evicting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementKind {
    Initialize,
    Writeback,
}

/// A request the backing-side view issues to user space to service.
#[derive(Debug, Clone, Copy)]
pub struct ManagementRequest {
    pub kind: ManagementKind,
    pub offset: usize,
    pub len: usize,
}

struct Page {
    state: PageState,
    frame: Option<PhysicalAddress>,
    dirty: bool,
    waiters: Vec<u64>,
}

impl Page {
    fn new() -> Self {
        Self {
            state: PageState::Missing,
            frame: None,
            dirty: false,
            waiters: Vec::new(),
        }
    }
}

/// Shared page table plus management-request queue between a backing view
/// (the side user space dequeues requests from) and any number of frontal
/// views mapping the same pages.
pub struct ManagedCore {
    allocator: Arc<dyn PhysicalAllocator>,
    pages: Mutex<Vec<Page>>,
    requests: Mutex<VecDeque<ManagementRequest>>,
    ready: Mutex<BTreeMap<u64, ResolvedSegment>>,
    /// Clean pages available for reclaim, most-recently-clean last.
    reclaim_list: Mutex<VecDeque<usize>>,
}

impl ManagedCore {
    pub fn new(page_count: usize, allocator: Arc<dyn PhysicalAllocator>) -> Arc<Self> {
        let mut pages = Vec::with_capacity(page_count);
        pages.resize_with(page_count, Page::new);
        Arc::new(Self {
            allocator,
            pages: Mutex::new(pages),
            requests: Mutex::new(VecDeque::new()),
            ready: Mutex::new(BTreeMap::new()),
            reclaim_list: Mutex::new(VecDeque::new()),
        })
    }

    /// Dequeue the next request a user-space pager should service.
    pub fn dequeue_request(&self) -> Option<ManagementRequest> {
        self.requests.lock().pop_front()
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn page_index(offset: usize) -> usize {
        offset / PAGE_SIZE
    }

    fn fetch(&self, offset: usize) -> HelResult<FetchOutcome> {
        let idx = Self::page_index(offset);
        let mut pages = self.pages.lock();
        let page = pages.get_mut(idx).ok_or(HelError::OutOfBounds)?;
        match page.state {
            PageState::Present => {
                let frame = page.frame.expect("present page has a frame");
                Ok(FetchOutcome::Ready(ResolvedSegment {
                    physical: frame,
                    len: PAGE_SIZE - (offset % PAGE_SIZE),
                    cache: CacheMode::Normal,
                }))
            }
            PageState::Missing => {
                page.state = PageState::WantInit;
                let waiter = next_waiter_id();
                page.waiters.push(waiter);
                self.requests.lock().push_back(ManagementRequest {
                    kind: ManagementKind::Initialize,
                    offset: idx * PAGE_SIZE,
                    len: PAGE_SIZE,
                });
                Ok(FetchOutcome::Pending(waiter))
            }
            PageState::WantInit | PageState::Initializing => {
                let waiter = next_waiter_id();
                page.waiters.push(waiter);
                Ok(FetchOutcome::Pending(waiter))
            }
            PageState::Evicting | PageState::WritingbackAgain => {
                let waiter = next_waiter_id();
                page.waiters.push(waiter);
                Ok(FetchOutcome::Pending(waiter))
            }
            PageState::WantWriteback | PageState::Writingback => {
                let frame = page.frame.expect("writeback page has a frame");
                Ok(FetchOutcome::Ready(ResolvedSegment {
                    physical: frame,
                    len: PAGE_SIZE - (offset % PAGE_SIZE),
                    cache: CacheMode::Normal,
                }))
            }
        }
    }

    /// User space's reply to a dequeued management request: calling this
    /// with `Initialize` moves the range to `Present` and resolves every
    /// queued fetch; calling it with `Writeback` clears the dirty bit
    /// unless a fresh `mark_dirty` arrived mid-writeback, in which case the
    /// writeback is reissued instead of the page going clean.
    pub fn update_range(&self, kind: ManagementKind, offset: usize, len: usize) -> HelResult<()> {
        let start = Self::page_index(offset);
        let end = Self::page_index(offset + len.saturating_sub(1)) + 1;
        let mut pages = self.pages.lock();
        for idx in start..end {
            let page = pages.get_mut(idx).ok_or(HelError::OutOfBounds)?;
            match kind {
                ManagementKind::Initialize => {
                    if page.frame.is_none() {
                        page.frame = Some(self.allocator.allocate().ok_or(HelError::NoMemory)?);
                    }
                    page.state = PageState::Present;
                    for waiter in page.waiters.drain(..) {
                        self.ready.lock().insert(
                            waiter,
                            ResolvedSegment {
                                physical: page.frame.unwrap(),
                                len: PAGE_SIZE,
                                cache: CacheMode::Normal,
                            },
                        );
                    }
                    self.reclaim_list.lock().push_back(idx);
                }
                ManagementKind::Writeback => match page.state {
                    PageState::Writingback => {
                        page.state = PageState::Present;
                        page.dirty = false;
                        self.reclaim_list.lock().push_back(idx);
                    }
                    PageState::WritingbackAgain => {
                        // A markDirty arrived mid-writeback: reissue instead
                        // of declaring the page clean.
                        page.state = PageState::WantWriteback;
                        self.requests.lock().push_back(ManagementRequest {
                            kind: ManagementKind::Writeback,
                            offset: idx * PAGE_SIZE,
                            len: PAGE_SIZE,
                        });
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }

    /// Collect the waiters resolved by the last `update_range`/`fetch`.
    pub fn take_ready(&self, waiter: u64) -> Option<ResolvedSegment> {
        self.ready.lock().remove(&waiter)
    }

    pub fn mark_dirty(&self, offset: usize, len: usize) {
        let start = Self::page_index(offset);
        let end = Self::page_index(offset + len.saturating_sub(1)) + 1;
        let mut pages = self.pages.lock();
        for idx in start..end {
            if let Some(page) = pages.get_mut(idx) {
                if page.state == PageState::Present && !page.dirty {
                    page.dirty = true;
                    page.state = PageState::WantWriteback;
                    self.requests.lock().push_back(ManagementRequest {
                        kind: ManagementKind::Writeback,
                        offset: idx * PAGE_SIZE,
                        len: PAGE_SIZE,
                    });
                } else if page.state == PageState::Writingback {
                    // Dirtied again while a writeback is already in flight.
                    page.state = PageState::WritingbackAgain;
                }
            }
        }
    }

    /// Evict the oldest clean page, notifying `observers` and waiting for
    /// every observer to confirm before the frame returns to the allocator.
    pub fn evict_one(&self, observers: &[Weak<dyn Observer>]) -> HelResult<()> {
        let idx = self
            .reclaim_list
            .lock()
            .pop_front()
            .ok_or(HelError::IllegalState)?;
        let frame = {
            let mut pages = self.pages.lock();
            let page = &mut pages[idx];
            if page.state != PageState::Present || page.dirty {
                // Not actually evictable right now; put it back.
                self.reclaim_list.lock().push_back(idx);
                return Err(HelError::IllegalState);
            }
            page.state = PageState::Evicting;
            page.frame.take()
        };
        let offset = idx * PAGE_SIZE;
        for observer in observers {
            if let Some(observer) = observer.upgrade() {
                while !observer.on_evict(offset, PAGE_SIZE) {
                    core::hint::spin_loop();
                }
            }
        }
        if let Some(frame) = frame {
            self.allocator.deallocate(frame);
        }
        let mut pages = self.pages.lock();
        pages[idx].state = PageState::Missing;
        Ok(())
    }
}

/// The frontal view clients map; a thin facade over the shared `ManagedCore`
/// plus the observer list views normally carry.
pub struct ManagedView {
    core: Arc<ManagedCore>,
    view_core: ViewCore,
}

impl ManagedView {
    pub fn new(len: usize, allocator: Arc<dyn PhysicalAllocator>) -> HelResult<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(HelError::IllegalArgs);
        }
        Ok(Self {
            core: ManagedCore::new(len / PAGE_SIZE, allocator),
            view_core: ViewCore::new(len, CacheMode::Normal),
        })
    }

    pub fn backing(&self) -> Arc<ManagedCore> {
        self.core.clone()
    }
}

impl MemoryView for ManagedView {
    fn len(&self) -> usize {
        *self.view_core.len.lock()
    }

    fn cache_mode(&self) -> CacheMode {
        self.view_core.cache
    }

    fn allowed_rights(&self) -> Rights {
        Rights::READ | Rights::WRITE
    }

    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome> {
        if offset >= self.len() {
            return Ok(FetchOutcome::Fault);
        }
        self.core.fetch(offset)
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len() {
            return None;
        }
        let idx = offset / PAGE_SIZE;
        let pages = self.core.pages.lock();
        let page = pages.get(idx)?;
        page.frame.map(|f| (f, CacheMode::Normal))
    }

    fn mark_dirty(&self, offset: usize, len: usize) {
        self.core.mark_dirty(offset, len);
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) {
        self.view_core.add_observer(observer);
    }

    fn remove_observer(&self, observer: &Weak<dyn Observer>) {
        self.view_core.remove_observer(observer);
    }

    fn notify_evict(&self, offset: usize, len: usize) {
        self.view_core.notify_evict(offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestPhysicalAllocator;

    #[test]
    fn fetch_then_initialize_resolves_waiter() {
        let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let view = ManagedView::new(PAGE_SIZE, alloc).unwrap();
        let waiter = match view.fetch_range(0).unwrap() {
            FetchOutcome::Pending(w) => w,
            _ => panic!("expected pending on first fetch"),
        };
        assert_eq!(view.core.pending_request_count(), 1);
        let req = view.core.dequeue_request().unwrap();
        assert_eq!(req.kind, ManagementKind::Initialize);
        view.core.update_range(ManagementKind::Initialize, req.offset, req.len).unwrap();
        assert!(view.core.take_ready(waiter).is_some());
        match view.fetch_range(0).unwrap() {
            FetchOutcome::Ready(_) => {}
            _ => panic!("expected ready after initialize"),
        }
    }

    #[test]
    fn mark_dirty_then_writeback_then_evict() {
        let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let view = ManagedView::new(PAGE_SIZE, alloc).unwrap();
        let _ = view.fetch_range(0).unwrap();
        let req = view.core.dequeue_request().unwrap();
        view.core.update_range(ManagementKind::Initialize, req.offset, req.len).unwrap();

        view.mark_dirty(0, PAGE_SIZE);
        let wb = view.core.dequeue_request().unwrap();
        assert_eq!(wb.kind, ManagementKind::Writeback);
        view.core.update_range(ManagementKind::Writeback, wb.offset, wb.len).unwrap();

        assert!(view.core.evict_one(&[]).is_ok());
        assert!(view.peek(0).is_none());
    }

    #[test]
    fn writeback_again_reissues_instead_of_clearing() {
        let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let view = ManagedView::new(PAGE_SIZE, alloc).unwrap();
        let _ = view.fetch_range(0).unwrap();
        let req = view.core.dequeue_request().unwrap();
        view.core.update_range(ManagementKind::Initialize, req.offset, req.len).unwrap();

        view.mark_dirty(0, PAGE_SIZE);
        let wb = view.core.dequeue_request().unwrap();
        // Simulate a second dirty while writeback is in flight.
        {
            let mut pages = view.core.pages.lock();
            pages[0].state = PageState::Writingback;
        }
        view.mark_dirty(0, PAGE_SIZE);
        view.core.update_range(ManagementKind::Writeback, wb.offset, wb.len).unwrap();
        // Should have reissued rather than gone clean.
        assert_eq!(view.core.pending_request_count(), 1);
    }
}
