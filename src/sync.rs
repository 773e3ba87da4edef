//! Wait queue shared by events, IRQ objects, and futexes.
//!
//! Stripped down to match this crate's model: nothing here actually blocks
//! an OS thread. Waiters are opaque ids recorded here and handed to a `SchedulerHooks`
//! collaborator to mark runnable again; the caller is responsible for
//! re-polling whatever condition it was waiting on.

use alloc::vec::Vec;
use spin::Mutex;

use crate::collaborators::SchedulerHooks;

pub struct WaitQueue {
    waiters: Mutex<Vec<u64>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { waiters: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, waiter_id: u64) {
        self.waiters.lock().push(waiter_id);
    }

    /// Drain every registered waiter and mark each runnable.
    pub fn wake_all(&self, scheduler: &dyn SchedulerHooks) -> usize {
        let drained: Vec<u64> = self.waiters.lock().drain(..).collect();
        let count = drained.len();
        for id in drained {
            scheduler.mark_runnable(id);
        }
        count
    }

    /// Wake the oldest registered waiter, if any.
    pub fn wake_one(&self, scheduler: &dyn SchedulerHooks) -> Option<u64> {
        let id = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                Some(waiters.remove(0))
            }
        };
        if let Some(id) = id {
            scheduler.mark_runnable(id);
        }
        id
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Remove a specific waiter before it's woken, e.g. because its deadline
    /// fired first. Returns `true` if it was still registered.
    pub fn remove(&self, waiter_id: u64) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|&id| id == waiter_id) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestScheduler;

    #[test]
    fn wake_all_drains_and_marks_every_waiter_runnable() {
        let queue = WaitQueue::new();
        queue.register(1);
        queue.register(2);
        let scheduler = TestScheduler::new();
        assert_eq!(queue.wake_all(&scheduler), 2);
        assert_eq!(*scheduler.woken.lock(), alloc::vec![1, 2]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn wake_one_takes_oldest_first() {
        let queue = WaitQueue::new();
        queue.register(5);
        queue.register(6);
        let scheduler = TestScheduler::new();
        assert_eq!(queue.wake_one(&scheduler), Some(5));
        assert_eq!(queue.pending_count(), 1);
    }
}
