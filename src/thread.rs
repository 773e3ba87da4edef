//! Threads: an executor context bound to a universe and address space, plus
//! the observation stream debuggers and parents poll for state changes.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::address_space::AddressSpace;
use crate::error::{HelError, HelResult};
use crate::handle::Universe;
use crate::sync::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Blocked,
    Ready,
    Running,
    Terminated,
}

/// Why a thread stopped running long enough to be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Null,
    Interrupt,
    Panic,
    Breakpoint,
    PageFault,
    GeneralFault,
    DivByZero,
    IllegalInstruction,
    SuperCall(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct ObservationRecord {
    pub sequence: u64,
    pub observation: Observation,
}

/// Which register file a caller wants; sizes are architecture-defined and
/// queried rather than hard-coded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSet {
    Program,
    General,
    Thread,
    Simd,
    Signal,
    Virtualization,
    Debug,
}

pub trait RegisterFile: Send + Sync {
    fn size_of(&self, set: RegisterSet) -> usize;
    fn read(&self, set: RegisterSet, out: &mut [u8]) -> HelResult<()>;
    fn write(&self, set: RegisterSet, data: &[u8]) -> HelResult<()>;
}

struct ObservationLog {
    sequence: AtomicU64,
    latest: Mutex<ObservationRecord>,
    waiters: WaitQueue,
}

pub struct Thread {
    pub universe: Arc<Universe>,
    pub address_space: Arc<AddressSpace>,
    registers: Arc<dyn RegisterFile>,
    state: Mutex<RunState>,
    affinity: AtomicU64,
    priority: AtomicU32,
    observation: ObservationLog,
}

impl Thread {
    pub fn new(universe: Arc<Universe>, address_space: Arc<AddressSpace>, registers: Arc<dyn RegisterFile>) -> Arc<Self> {
        Arc::new(Self {
            universe,
            address_space,
            registers,
            state: Mutex::new(RunState::Ready),
            affinity: AtomicU64::new(u64::MAX),
            priority: AtomicU32::new(0),
            observation: ObservationLog {
                sequence: AtomicU64::new(0),
                latest: Mutex::new(ObservationRecord { sequence: 0, observation: Observation::Null }),
                waiters: WaitQueue::new(),
            },
        })
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn affinity(&self) -> u64 {
        self.affinity.load(Ordering::Acquire)
    }

    pub fn set_affinity(&self, mask: u64) {
        self.affinity.store(mask, Ordering::Release);
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn register_set_size(&self, set: RegisterSet) -> usize {
        self.registers.size_of(set)
    }

    pub fn read_registers(&self, set: RegisterSet, out: &mut [u8]) -> HelResult<()> {
        if matches!(self.state(), RunState::Terminated) {
            return Err(HelError::ThreadTerminated);
        }
        self.registers.read(set, out)
    }

    pub fn write_registers(&self, set: RegisterSet, data: &[u8]) -> HelResult<()> {
        if matches!(self.state(), RunState::Terminated) {
            return Err(HelError::ThreadTerminated);
        }
        self.registers.write(set, data)
    }

    fn transition(&self, from_any: &[RunState], to: RunState) -> HelResult<()> {
        let mut state = self.state.lock();
        if *state == RunState::Terminated {
            return Err(HelError::ThreadTerminated);
        }
        if !from_any.contains(&*state) {
            return Err(HelError::IllegalState);
        }
        *state = to;
        Ok(())
    }

    pub fn resume(&self) -> HelResult<()> {
        self.transition(&[RunState::Blocked, RunState::Ready], RunState::Running)
    }

    pub fn block(&self) -> HelResult<()> {
        self.transition(&[RunState::Running], RunState::Blocked)
    }

    pub fn kill(&self) -> HelResult<()> {
        let mut state = self.state.lock();
        if *state == RunState::Terminated {
            return Err(HelError::ThreadTerminated);
        }
        *state = RunState::Terminated;
        Ok(())
    }

    pub fn interrupt(&self, scheduler: &dyn crate::collaborators::SchedulerHooks) -> HelResult<()> {
        self.transition(&[RunState::Running, RunState::Ready], RunState::Blocked)?;
        self.post_observation(Observation::Interrupt, scheduler);
        Ok(())
    }

    /// Append an observation and wake anyone blocked in `observe`.
    pub fn post_observation(&self, observation: Observation, scheduler: &dyn crate::collaborators::SchedulerHooks) {
        let sequence = self.observation.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        *self.observation.latest.lock() = ObservationRecord { sequence, observation };
        self.observation.waiters.wake_all(scheduler);
    }

    /// `helObserveThread`-style poll: returns the latest record only once
    /// its sequence has advanced past `since`, else parks `waiter_id`.
    pub fn observe(&self, since: u64, waiter_id: u64) -> Option<ObservationRecord> {
        let record = *self.observation.latest.lock();
        if record.sequence > since {
            Some(record)
        } else {
            self.observation.waiters.register(waiter_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::collaborators;

    struct NullRegisters;
    impl RegisterFile for NullRegisters {
        fn size_of(&self, _set: RegisterSet) -> usize {
            256
        }
        fn read(&self, _set: RegisterSet, out: &mut [u8]) -> HelResult<()> {
            out.fill(0);
            Ok(())
        }
        fn write(&self, _set: RegisterSet, _data: &[u8]) -> HelResult<()> {
            Ok(())
        }
    }

    fn make_thread() -> Arc<Thread> {
        let universe = Universe::new();
        let space = AddressSpace::new(0x1000, 0x1000_0000);
        Thread::new(universe, space, Arc::new(NullRegisters))
    }

    #[test]
    fn resume_then_block_round_trips_run_state() {
        let thread = make_thread();
        assert_eq!(thread.state(), RunState::Ready);
        thread.resume().unwrap();
        assert_eq!(thread.state(), RunState::Running);
        thread.block().unwrap();
        assert_eq!(thread.state(), RunState::Blocked);
    }

    #[test]
    fn operations_after_kill_fail_with_thread_terminated() {
        let thread = make_thread();
        thread.kill().unwrap();
        assert!(matches!(thread.resume(), Err(HelError::ThreadTerminated)));
        assert!(matches!(thread.kill(), Err(HelError::ThreadTerminated)));
    }

    #[test]
    fn observe_blocks_until_sequence_advances() {
        let collab = collaborators();
        let thread = make_thread();
        assert!(thread.observe(0, 42).is_none());
        thread.post_observation(Observation::Breakpoint, collab.scheduler.as_ref());
        let record = thread.observe(0, 43).unwrap();
        assert_eq!(record.observation, Observation::Breakpoint);
    }
}
