//! IRQ objects: a sink attached to a pin, observable the same way a
//! `BitsetEvent` is, plus the ack/nack/kick protocol a driver uses to
//! hand masking back to the kernel.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::collaborators::SchedulerHooks;
use crate::sync::WaitQueue;

/// What happens to the pin's mask once a raise has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmaskStrategy {
    MaskThenEoi,
    AutoEoi,
}

/// A kernel-side closure run on every raise, before any waiter is woken.
/// Stands in for in-kernel IRQ automation (e.g. acking a PIC) that doesn't
/// need a userspace round-trip.
pub trait IrqAutomation: Send + Sync {
    fn on_raise(&self, sequence: u64);
}

pub struct IrqObject {
    sequence: AtomicU64,
    acked_sequence: AtomicU64,
    strategy: UnmaskStrategy,
    masked: Mutex<bool>,
    automation: Option<Box<dyn IrqAutomation>>,
    waiters: WaitQueue,
}

impl IrqObject {
    pub fn new(strategy: UnmaskStrategy) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            acked_sequence: AtomicU64::new(0),
            strategy,
            masked: Mutex::new(false),
            automation: None,
            waiters: WaitQueue::new(),
        }
    }

    pub fn with_automation(strategy: UnmaskStrategy, automation: Box<dyn IrqAutomation>) -> Self {
        Self { automation: Some(automation), ..Self::new(strategy) }
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn is_masked(&self) -> bool {
        *self.masked.lock()
    }

    pub fn register_waiter(&self, waiter_id: u64) {
        self.waiters.register(waiter_id);
    }

    /// Hardware raise: bump the sequence, run any bound automation, and wake
    /// observers.
    pub fn raise(&self, scheduler: &dyn SchedulerHooks) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        if matches!(self.strategy, UnmaskStrategy::MaskThenEoi) {
            *self.masked.lock() = true;
        }
        if let Some(automation) = &self.automation {
            automation.on_raise(seq);
        }
        self.waiters.wake_all(scheduler);
        seq
    }

    /// Driver acks a handled raise. Stale acks (wrong sequence) are silently
    /// dropped. Unmasks if the strategy requires an explicit EOI.
    pub fn ack(&self, seq: u64) {
        if seq != self.current_sequence() {
            return;
        }
        self.acked_sequence.store(seq, Ordering::Release);
        if matches!(self.strategy, UnmaskStrategy::MaskThenEoi) {
            *self.masked.lock() = false;
        }
    }

    /// Driver nacks: it saw `seq` but couldn't handle it. Stale nacks are
    /// dropped the same way stale acks are.
    pub fn nack(&self, seq: u64) {
        if seq != self.current_sequence() {
            return;
        }
    }

    /// Force-unmask without an ack.
    pub fn kick(&self) {
        *self.masked.lock() = false;
    }
}
