//! Trait objects standing in for externally-owned collaborators that live
//! outside this crate's scope: the physical frame allocator, the
//! timer/clock, and the scheduler's work-queue hook.
//!
//! These are injected as explicit context handles threaded through
//! constructors rather than kept as module-level singletons, so the engine
//! can be exercised on a hosted target under a plain `cfg(test)` build
//! linked against `std`.

use alloc::sync::Arc;

use crate::memory::PhysicalAddress;

/// Hands out and reclaims physical page frames. The real kernel's buddy
/// allocator lives outside this crate's scope; tests use a simple bump
/// arena (see `TestPhysicalAllocator`).
pub trait PhysicalAllocator: Send + Sync {
    fn allocate(&self) -> Option<PhysicalAddress>;
    fn deallocate(&self, addr: PhysicalAddress);
}

/// A monotonic nanosecond clock, standing in for the timer hardware.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// Thread readiness callback, standing in for the in-kernel fiber/scheduler.
/// Invoked whenever a blocked thread (or futex/event waiter) becomes
/// runnable again; the real scheduler decides when to actually run it.
pub trait SchedulerHooks: Send + Sync {
    fn mark_runnable(&self, thread_id: u64);
}

/// Bundle of collaborators threaded through constructors that need them.
#[derive(Clone)]
pub struct Collaborators {
    pub physical: Arc<dyn PhysicalAllocator>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn SchedulerHooks>,
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;
    use alloc::vec::Vec;

    /// Bump allocator over a fixed arena; frames are never really reused,
    /// which is fine for unit tests that only allocate a handful of pages.
    pub struct TestPhysicalAllocator {
        next: AtomicU64,
        limit: u64,
        freed: Mutex<Vec<PhysicalAddress>>,
    }

    impl TestPhysicalAllocator {
        pub fn new(page_count: u64) -> Self {
            Self {
                next: AtomicU64::new(1),
                limit: page_count + 1,
                freed: Mutex::new(Vec::new()),
            }
        }
    }

    impl PhysicalAllocator for TestPhysicalAllocator {
        fn allocate(&self) -> Option<PhysicalAddress> {
            if let Some(addr) = self.freed.lock().pop() {
                return Some(addr);
            }
            let frame = self.next.fetch_add(1, Ordering::Relaxed);
            if frame >= self.limit {
                return None;
            }
            Some(PhysicalAddress::new(frame * crate::memory::PAGE_SIZE as u64))
        }

        fn deallocate(&self, addr: PhysicalAddress) {
            self.freed.lock().push(addr);
        }
    }

    /// Manually-advanced clock so tests can deterministically exercise
    /// deadlines without depending on wall-clock time.
    pub struct TestClock {
        now: AtomicU64,
    }

    impl TestClock {
        pub fn new() -> Self {
            Self { now: AtomicU64::new(0) }
        }

        pub fn advance(&self, nanos: u64) {
            self.now.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    impl Clock for TestClock {
        fn now_nanos(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
    }

    pub struct TestScheduler {
        pub woken: Mutex<Vec<u64>>,
    }

    impl TestScheduler {
        pub fn new() -> Self {
            Self { woken: Mutex::new(Vec::new()) }
        }
    }

    impl SchedulerHooks for TestScheduler {
        fn mark_runnable(&self, thread_id: u64) {
            self.woken.lock().push(thread_id);
        }
    }

    pub fn collaborators() -> Collaborators {
        Collaborators {
            physical: Arc::new(TestPhysicalAllocator::new(4096)),
            clock: Arc::new(TestClock::new()),
            scheduler: Arc::new(TestScheduler::new()),
        }
    }
}
