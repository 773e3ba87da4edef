//! Global futex realm keyed by physical identity rather than virtual
//! address, so two mappings of the same physical page (e.g. across a
//! fork) contend on the same futex.

use hashbrown::HashMap;
use spin::Mutex;

use crate::collaborators::SchedulerHooks;
use crate::error::{HelError, HelResult};
use crate::sync::WaitQueue;

/// Stable identity a caller derives by translating a virtual address
/// through its address space to a physical frame. Opaque to this module.
pub type FutexIdentity = u64;

pub struct FutexRealm {
    table: Mutex<HashMap<FutexIdentity, WaitQueue>>,
}

impl FutexRealm {
    pub fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()) }
    }

    /// Atomically compare `current` (the value the caller just read from the
    /// user word) against `expected`; if they match, register `waiter_id` to
    /// sleep on `identity`. If they differ, the caller raced a concurrent
    /// update and should retry rather than sleep.
    pub fn wait(&self, identity: FutexIdentity, waiter_id: u64, current: u32, expected: u32) -> HelResult<()> {
        if current != expected {
            return Err(HelError::IllegalState);
        }
        self.table.lock().entry(identity).or_insert_with(WaitQueue::new).register(waiter_id);
        Ok(())
    }

    /// Wake up to `max` waiters on `identity`.
    pub fn wake(&self, identity: FutexIdentity, scheduler: &dyn SchedulerHooks, max: usize) -> usize {
        let table = self.table.lock();
        let Some(queue) = table.get(&identity) else {
            return 0;
        };
        let mut woken = 0;
        while woken < max {
            if queue.wake_one(scheduler).is_none() {
                break;
            }
            woken += 1;
        }
        woken
    }

    /// Cancel a deadline-losing wait before it gets woken by `wake`.
    pub fn cancel_wait(&self, identity: FutexIdentity, waiter_id: u64) -> bool {
        self.table
            .lock()
            .get(&identity)
            .map(|queue| queue.remove(waiter_id))
            .unwrap_or(false)
    }
}

impl Default for FutexRealm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestScheduler;

    #[test]
    fn mismatched_current_fails_without_sleeping() {
        let realm = FutexRealm::new();
        assert!(realm.wait(1, 10, 5, 6).is_err());
        let scheduler = TestScheduler::new();
        assert_eq!(realm.wake(1, &scheduler, 10), 0);
    }

    #[test]
    fn wake_respects_max_and_leaves_remainder_queued() {
        let realm = FutexRealm::new();
        realm.wait(1, 10, 0, 0).unwrap();
        realm.wait(1, 11, 0, 0).unwrap();
        let scheduler = TestScheduler::new();
        assert_eq!(realm.wake(1, &scheduler, 1), 1);
        assert_eq!(*scheduler.woken.lock(), alloc::vec![10]);
        assert_eq!(realm.wake(1, &scheduler, 10), 1);
    }

    #[test]
    fn cancel_wait_removes_a_waiter_before_it_is_woken() {
        let realm = FutexRealm::new();
        realm.wait(1, 10, 0, 0).unwrap();
        assert!(realm.cancel_wait(1, 10));
        let scheduler = TestScheduler::new();
        assert_eq!(realm.wake(1, &scheduler, 10), 0);
    }
}
