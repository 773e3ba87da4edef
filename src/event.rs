//! One-shot and bitset events: the simplest observable-state primitives.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::collaborators::SchedulerHooks;
use crate::sync::WaitQueue;

/// A latch that goes from unset to set exactly once.
pub struct OneShotEvent {
    raised: AtomicBool,
    waiters: WaitQueue,
}

impl OneShotEvent {
    pub const fn new() -> Self {
        Self { raised: AtomicBool::new(false), waiters: WaitQueue::new() }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Promote unset to set and wake every waiter. A second call is a no-op
    /// and returns `false`.
    pub fn trigger(&self, scheduler: &dyn SchedulerHooks) -> bool {
        if self.raised.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.waiters.wake_all(scheduler);
        true
    }

    pub fn register_waiter(&self, waiter_id: u64) {
        self.waiters.register(waiter_id);
    }
}

impl Default for OneShotEvent {
    fn default() -> Self {
        Self::new()
    }
}

const BITSET_WIDTH: usize = 32;

/// 32 independent bit-latches, each with its own monotonic sequence number
/// so a waiter can ask "which bits advanced past what I last observed".
pub struct BitsetEvent {
    sequences: [AtomicU64; BITSET_WIDTH],
    waiters: WaitQueue,
}

impl BitsetEvent {
    pub fn new() -> Self {
        Self {
            sequences: core::array::from_fn(|_| AtomicU64::new(0)),
            waiters: WaitQueue::new(),
        }
    }

    /// Bump the sequence of every bit set in `bits` and wake all waiters.
    pub fn trigger(&self, bits: u32, scheduler: &dyn SchedulerHooks) {
        for i in 0..BITSET_WIDTH {
            if bits & (1 << i) != 0 {
                self.sequences[i].fetch_add(1, Ordering::AcqRel);
            }
        }
        self.waiters.wake_all(scheduler);
    }

    /// Bits whose sequence has advanced past `since[i]`.
    pub fn advanced_since(&self, since: &[u64; BITSET_WIDTH]) -> u32 {
        let mut out = 0u32;
        for i in 0..BITSET_WIDTH {
            if self.sequences[i].load(Ordering::Acquire) > since[i] {
                out |= 1 << i;
            }
        }
        out
    }

    pub fn current_sequences(&self) -> [u64; BITSET_WIDTH] {
        core::array::from_fn(|i| self.sequences[i].load(Ordering::Acquire))
    }

    pub fn register_waiter(&self, waiter_id: u64) {
        self.waiters.register(waiter_id);
    }
}

impl Default for BitsetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestScheduler;

    #[test]
    fn one_shot_second_trigger_is_a_noop() {
        let event = OneShotEvent::new();
        let scheduler = TestScheduler::new();
        event.register_waiter(1);
        assert!(event.trigger(&scheduler));
        assert!(!event.trigger(&scheduler));
        assert_eq!(*scheduler.woken.lock(), alloc::vec![1]);
    }

    #[test]
    fn bitset_reports_only_bits_advanced_since_snapshot() {
        let event = BitsetEvent::new();
        let scheduler = TestScheduler::new();
        let baseline = event.current_sequences();
        event.trigger(0b101, &scheduler);
        assert_eq!(event.advanced_since(&baseline), 0b101);
    }
}
