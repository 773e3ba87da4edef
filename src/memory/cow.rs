//! Copy-on-write view over a parent chain.
//!
//! Ancestor walks are iterative rather than recursive, bounded by the chain
//! depth at fork time, so a long fork lineage never grows the stack.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use spin::Mutex;

use crate::collaborators::PhysicalAllocator;
use crate::error::{HelError, HelResult};
use crate::memory::{
    CacheMode, FetchOutcome, MemoryView, Observer, PhysicalAddress, Rights, ResolvedSegment,
    PAGE_SIZE,
};

/// Either the ultimate base view, or another node further up the chain.
pub enum CowParent {
    Base(Arc<dyn MemoryView>),
    Node(Arc<CowChainNode>),
}

/// One generation of a copy-on-write snapshot: a radix index from in-chain
/// page index to a privately-allocated physical frame, plus the parent to
/// fall back to on a read miss.
pub struct CowChainNode {
    parent: CowParent,
    private: Mutex<BTreeMap<usize, PhysicalAddress>>,
    allocator: Arc<dyn PhysicalAllocator>,
}

impl CowChainNode {
    pub fn fork_from_base(base: Arc<dyn MemoryView>, allocator: Arc<dyn PhysicalAllocator>) -> Arc<Self> {
        Arc::new(Self {
            parent: CowParent::Base(base),
            private: Mutex::new(BTreeMap::new()),
            allocator: allocator,
        })
    }

    pub fn fork_from_node(parent: Arc<CowChainNode>, allocator: Arc<dyn PhysicalAllocator>) -> Arc<Self> {
        Arc::new(Self {
            parent: CowParent::Node(parent),
            private: Mutex::new(BTreeMap::new()),
            allocator,
        })
    }

    /// Resolve a read by walking ancestors until a populated page is found
    /// or the base is reached.
    fn resolve_read(&self, page_idx: usize, page_off: usize) -> HelResult<FetchOutcome> {
        if let Some(frame) = self.private.lock().get(&page_idx).copied() {
            return Ok(FetchOutcome::Ready(ResolvedSegment {
                physical: PhysicalAddress::new(frame.data() + page_off as u64),
                len: PAGE_SIZE - page_off,
                cache: CacheMode::Normal,
            }));
        }

        // Iterative ancestor walk — never recurse.
        let mut current: Option<Arc<CowChainNode>> = match &self.parent {
            CowParent::Node(node) => Some(node.clone()),
            CowParent::Base(base) => {
                return base.fetch_range(page_idx * PAGE_SIZE + page_off);
            }
        };
        loop {
            let node = current.expect("loop invariant: current is Some while looping");
            if let Some(frame) = node.private.lock().get(&page_idx).copied() {
                return Ok(FetchOutcome::Ready(ResolvedSegment {
                    physical: PhysicalAddress::new(frame.data() + page_off as u64),
                    len: PAGE_SIZE - page_off,
                    cache: CacheMode::Normal,
                }));
            }
            match &node.parent {
                CowParent::Node(next) => current = Some(next.clone()),
                CowParent::Base(base) => {
                    return base.fetch_range(page_idx * PAGE_SIZE + page_off);
                }
            }
        }
    }

    /// Resolve the physical identity of a page as the caller would observe
    /// it via `peek`, without populating it.
    fn peek_identity(&self, page_idx: usize) -> Option<PhysicalAddress> {
        if let Some(frame) = self.private.lock().get(&page_idx).copied() {
            return Some(frame);
        }
        let mut current: Option<Arc<CowChainNode>> = match &self.parent {
            CowParent::Node(node) => Some(node.clone()),
            CowParent::Base(base) => return base.peek(page_idx * PAGE_SIZE).map(|(p, _)| p),
        };
        loop {
            let node = current.expect("loop invariant");
            if let Some(frame) = node.private.lock().get(&page_idx).copied() {
                return Some(frame);
            }
            match &node.parent {
                CowParent::Node(next) => current = Some(next.clone()),
                CowParent::Base(base) => return base.peek(page_idx * PAGE_SIZE).map(|(p, _)| p),
            }
        }
    }

    /// A write allocates a private page in the topmost node and installs it
    /// atomically — a single lock-guarded insert, visible to readers the
    /// instant it completes.
    fn write_private(&self, page_idx: usize) -> HelResult<PhysicalAddress> {
        let mut private = self.private.lock();
        if let Some(existing) = private.get(&page_idx) {
            return Ok(*existing);
        }
        let frame = self.allocator.allocate().ok_or(HelError::NoMemory)?;
        private.insert(page_idx, frame);
        Ok(frame)
    }
}

pub struct CowView {
    node: Arc<CowChainNode>,
    len: usize,
}

impl CowView {
    pub fn new(node: Arc<CowChainNode>, len: usize) -> Self {
        Self { node, len }
    }

    /// Handle a write fault: populate a private page for `offset`'s page
    /// and return its physical identity.
    pub fn resolve_write(&self, offset: usize) -> HelResult<PhysicalAddress> {
        if offset >= self.len {
            return Err(HelError::OutOfBounds);
        }
        self.node.write_private(offset / PAGE_SIZE)
    }

    pub fn page_identity(&self, offset: usize) -> Option<PhysicalAddress> {
        self.node.peek_identity(offset / PAGE_SIZE)
    }
}

impl MemoryView for CowView {
    fn len(&self) -> usize {
        self.len
    }

    fn cache_mode(&self) -> CacheMode {
        CacheMode::Normal
    }

    fn allowed_rights(&self) -> Rights {
        Rights::READ | Rights::WRITE
    }

    fn fetch_range(&self, offset: usize) -> HelResult<FetchOutcome> {
        if offset >= self.len {
            return Ok(FetchOutcome::Fault);
        }
        let page_idx = offset / PAGE_SIZE;
        let page_off = offset % PAGE_SIZE;
        self.node.resolve_read(page_idx, page_off)
    }

    fn peek(&self, offset: usize) -> Option<(PhysicalAddress, CacheMode)> {
        if offset >= self.len {
            return None;
        }
        self.node
            .peek_identity(offset / PAGE_SIZE)
            .map(|p| (p, CacheMode::Normal))
    }

    fn add_observer(&self, _observer: Weak<dyn Observer>) {}
    fn remove_observer(&self, _observer: &Weak<dyn Observer>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestPhysicalAllocator;
    use crate::memory::hardware::HardwareView;

    #[test]
    fn cow_reads_are_idempotent_until_write() {
        let base: Arc<dyn MemoryView> =
            Arc::new(HardwareView::new(PhysicalAddress::new(0xAA_000), PAGE_SIZE * 4, CacheMode::Normal));
        let allocator: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let node = CowChainNode::fork_from_base(base, allocator);
        let view = CowView::new(node, PAGE_SIZE * 4);

        let first = view.page_identity(PAGE_SIZE).or_else(|| {
            let _ = view.fetch_range(PAGE_SIZE);
            view.page_identity(PAGE_SIZE)
        });
        let second = view.page_identity(PAGE_SIZE).or_else(|| {
            let _ = view.fetch_range(PAGE_SIZE);
            view.page_identity(PAGE_SIZE)
        });
        assert_eq!(first, second);
    }

    #[test]
    fn write_allocates_private_page_without_disturbing_other_pages() {
        let base: Arc<dyn MemoryView> =
            Arc::new(HardwareView::new(PhysicalAddress::new(0xAA_000), PAGE_SIZE * 4, CacheMode::Normal));
        let allocator: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(16));
        let node = CowChainNode::fork_from_base(base, allocator);
        let view = CowView::new(node, PAGE_SIZE * 4);

        let written = view.resolve_write(PAGE_SIZE).unwrap();
        let (identity, _) = view.peek(PAGE_SIZE).unwrap();
        assert_eq!(written, identity);

        // Page 0 still resolves to the shared base identity.
        let (other, _) = view.fetch_range(0).map(|outcome| match outcome {
            FetchOutcome::Ready(segment) => (segment.physical, segment.cache),
            _ => panic!("expected ready"),
        }).unwrap();
        assert_eq!(other.data(), 0xAA_000);
    }
}
