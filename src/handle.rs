//! Universes and handles: the capability table every other object in this
//! crate is reached through from outside.
//!
//! A `Universe` is a slab of `Descriptor`s. Handle-table operations take the
//! universe's own lock only for the duration of the table mutation itself —
//! a real kernel would additionally disable interrupts across that window
//! since the table can be touched from an IRQ handler; refcount increments
//! and drops of the `Arc` payload happen outside the lock.

use alloc::sync::Arc;
use slab::Slab;
use spin::Mutex;

use crate::address_space::AddressSpace;
use crate::event::{BitsetEvent, OneShotEvent};
use crate::irq::IrqObject;
use crate::memory::MemoryView;
use crate::memory::LockHandle;
use crate::queue::CompletionQueue;
use crate::stream::Lane;
use crate::thread::Thread;
use crate::virt::{VirtualizedCpu, VirtualizedSpace};
use crate::error::{HelError, HelResult};

/// A handle into some universe's table. Non-positive values are reserved
/// for pseudo-handles resolved without ever touching a table (see the
/// constants below); only `Handle(n)` with `n > 0` names a real slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub i64);

pub const NULL: Handle = Handle(0);
pub const THIS_THREAD: Handle = Handle(-1);
pub const THIS_UNIVERSE: Handle = Handle(-2);
pub const ZERO_PAGE: Handle = Handle(-3);

#[derive(Clone, Copy)]
pub struct IoPortRange {
    pub base: u16,
    pub len: u16,
}

#[derive(Clone)]
pub enum Descriptor {
    Universe(Arc<Universe>),
    Thread(Arc<Thread>),
    AddressSpace(Arc<AddressSpace>),
    MemoryView(Arc<dyn MemoryView>),
    Lane(Arc<Lane>),
    IrqObject(Arc<IrqObject>),
    OneShotEvent(Arc<OneShotEvent>),
    BitsetEvent(Arc<BitsetEvent>),
    IoPortSpace(IoPortRange),
    CompletionQueue(Arc<CompletionQueue>),
    MemoryLock(Arc<LockHandle>),
    VirtualizedSpace(Arc<VirtualizedSpace>),
    VirtualizedCpu(Arc<VirtualizedCpu>),
}

pub struct Universe {
    table: Mutex<Slab<Descriptor>>,
}

impl Universe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { table: Mutex::new(Slab::new()) })
    }

    /// Insert `desc` and return the handle naming it. O(1) amortized.
    pub fn attach(&self, desc: Descriptor) -> Handle {
        let key = self.table.lock().insert(desc);
        let handle = Handle(key as i64 + 1);
        crate::log::trace!("handle {} attached", handle.0);
        handle
    }

    fn slot(handle: Handle) -> HelResult<usize> {
        if handle.0 <= 0 {
            return Err(HelError::BadDescriptor);
        }
        Ok((handle.0 - 1) as usize)
    }

    pub fn get(&self, handle: Handle) -> HelResult<Descriptor> {
        let key = Self::slot(handle)?;
        self.table.lock().get(key).cloned().ok_or(HelError::NoDescriptor)
    }

    pub fn detach(&self, handle: Handle) -> HelResult<Descriptor> {
        let key = Self::slot(handle)?;
        let mut table = self.table.lock();
        if table.contains(key) {
            let desc = table.remove(key);
            drop(table);
            crate::log::trace!("handle {} detached", handle.0);
            Ok(desc)
        } else {
            Err(HelError::NoDescriptor)
        }
    }

    /// Move a descriptor from this universe into `target`. Not atomic
    /// across the two universes: a concurrent `detach` racing this call on
    /// the source side can make this return `noDescriptor` even though the
    /// handle looked valid a moment earlier.
    pub fn transfer(&self, handle: Handle, target: &Universe) -> HelResult<Handle> {
        let desc = self.detach(handle)?;
        Ok(target.attach(desc))
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OneShotEvent;

    #[test]
    fn attach_then_get_round_trips() {
        let universe = Universe::new();
        let event = Arc::new(OneShotEvent::new());
        let handle = universe.attach(Descriptor::OneShotEvent(event));
        assert!(universe.get(handle).is_ok());
    }

    #[test]
    fn detach_then_get_is_no_descriptor() {
        let universe = Universe::new();
        let event = Arc::new(OneShotEvent::new());
        let handle = universe.attach(Descriptor::OneShotEvent(event));
        assert!(universe.detach(handle).is_ok());
        assert!(matches!(universe.get(handle), Err(HelError::NoDescriptor)));
    }

    #[test]
    fn pseudo_handles_never_resolve_through_the_table() {
        let universe = Universe::new();
        assert!(matches!(universe.get(THIS_THREAD), Err(HelError::BadDescriptor)));
        assert!(matches!(universe.get(NULL), Err(HelError::BadDescriptor)));
    }

    #[test]
    fn transfer_moves_a_handle_between_universes() {
        let source = Universe::new();
        let target = Universe::new();
        let event = Arc::new(OneShotEvent::new());
        let handle = source.attach(Descriptor::OneShotEvent(event));
        let moved = source.transfer(handle, &target).unwrap();
        assert!(matches!(source.get(handle), Err(HelError::NoDescriptor)));
        assert!(target.get(moved).is_ok());
    }
}
