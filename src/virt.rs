//! Virtualized address space and CPU: separate variants of the address-space
//! concept used only when hardware virtualization is present.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::address_space::{AccessMode, AllocationPolicy};
use crate::error::{HelError, HelResult};
use crate::memory::{is_page_aligned, FetchOutcome, MemoryView, Rights};

/// A guest-physical mapping; unlike a host `AddressSpace::map`, a NULL
/// (zero) hint is a legal fixed address here rather than being rejected.
/// Guest-physical address zero is an ordinary, mappable address, so a fixed
/// hint of zero is unremarkable for a virtualized space even though it's
/// rejected for a host one.
struct GuestMapping {
    view: Arc<dyn MemoryView>,
    offset_in_view: usize,
    len: usize,
    rights: Rights,
}

pub struct VirtualizedSpace {
    mappings: Mutex<alloc::collections::BTreeMap<usize, GuestMapping>>,
}

impl VirtualizedSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: Mutex::new(alloc::collections::BTreeMap::new()),
        })
    }

    /// Map a guest-physical range. `hint == 0` (NULL) is accepted here even
    /// under `AllocationPolicy::Fixed`, unlike `AddressSpace::map`.
    pub fn map(
        &self,
        policy: AllocationPolicy,
        hint: usize,
        view: Arc<dyn MemoryView>,
        offset_in_view: usize,
        len: usize,
        rights: Rights,
    ) -> HelResult<usize> {
        if len == 0 || !is_page_aligned(len) || !is_page_aligned(offset_in_view) {
            return Err(HelError::IllegalArgs);
        }
        if matches!(policy, AllocationPolicy::Fixed | AllocationPolicy::FixedNoReplace) && !is_page_aligned(hint) {
            return Err(HelError::IllegalArgs);
        }
        if offset_in_view.checked_add(len).ok_or(HelError::IllegalArgs)? > view.len() {
            return Err(HelError::OutOfBounds);
        }
        if !view.allowed_rights().contains(rights) {
            return Err(HelError::IllegalArgs);
        }
        let base = match policy {
            AllocationPolicy::Fixed => hint,
            AllocationPolicy::FixedNoReplace => {
                let mappings = self.mappings.lock();
                let overlap = mappings
                    .iter()
                    .any(|(&b, m)| b < hint + len && hint < b + m.len);
                if overlap {
                    return Err(HelError::AlreadyExists);
                }
                hint
            }
            AllocationPolicy::PreferBottom | AllocationPolicy::PreferTop => {
                let mappings = self.mappings.lock();
                let mut cursor = hint;
                for (&b, m) in mappings.iter() {
                    if b >= cursor + len {
                        break;
                    }
                    if b + m.len > cursor {
                        cursor = crate::memory::align_up(b + m.len);
                    }
                }
                cursor
            }
        };
        self.mappings.lock().insert(
            base,
            GuestMapping {
                view,
                offset_in_view,
                len,
                rights,
            },
        );
        Ok(base)
    }

    pub fn unmap(&self, addr: usize, len: usize) -> HelResult<()> {
        let mut mappings = self.mappings.lock();
        let covered: Vec<usize> = mappings
            .iter()
            .filter(|(&b, m)| b < addr + len && addr < b + m.len)
            .map(|(&b, _)| b)
            .collect();
        for key in covered {
            mappings.remove(&key);
        }
        Ok(())
    }

    pub fn resolve_fault(&self, addr: usize, access: AccessMode) -> HelResult<FetchOutcome> {
        let mappings = self.mappings.lock();
        let (&base, mapping) = mappings
            .range(..=addr)
            .next_back()
            .filter(|(&base, m)| addr < base + m.len)
            .ok_or(HelError::Fault)?;
        let required = match access {
            AccessMode::Read => Rights::READ,
            AccessMode::Write => Rights::WRITE,
            AccessMode::Execute => Rights::EXECUTE,
        };
        if !mapping.rights.contains(required) {
            return Err(HelError::Fault);
        }
        mapping.view.fetch_range(mapping.offset_in_view + (addr - base))
    }
}

/// Why a `VirtualizedCpu::run` call returned control to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitReason {
    Hypercall(u64),
    IoPort { port: u16, write: bool },
    MmioFault { guest_physical: usize, write: bool },
    Halted,
    Interrupted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub general: [u64; 16],
    pub instruction_pointer: u64,
    pub flags: u64,
}

pub struct VirtualizedCpu {
    pub space: Arc<VirtualizedSpace>,
    registers: Mutex<GuestRegisters>,
    pending_exit: Mutex<Option<VmExitReason>>,
}

impl VirtualizedCpu {
    pub fn new(space: Arc<VirtualizedSpace>) -> Self {
        Self {
            space,
            registers: Mutex::new(GuestRegisters::default()),
            pending_exit: Mutex::new(None),
        }
    }

    pub fn registers(&self) -> GuestRegisters {
        *self.registers.lock()
    }

    pub fn set_registers(&self, regs: GuestRegisters) {
        *self.registers.lock() = regs;
    }

    /// Queue a vmexit reason to be returned by the next `run()`. Stands in
    /// for the real trap that a hardware-virtualized CPU would take; hosted
    /// tests drive exits explicitly through this hook instead.
    pub fn queue_exit(&self, reason: VmExitReason) {
        *self.pending_exit.lock() = Some(reason);
    }

    pub fn run(&self) -> HelResult<VmExitReason> {
        self.pending_exit.lock().take().ok_or(HelError::IllegalState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::TestPhysicalAllocator;
    use crate::collaborators::PhysicalAllocator;
    use crate::memory::allocated::AllocatedView;
    use crate::memory::{CacheMode, PAGE_SIZE};

    #[test]
    fn null_fixed_map_is_legal_for_virtualized_space() {
        let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(4));
        let view: Arc<dyn MemoryView> = Arc::new(AllocatedView::new(PAGE_SIZE, CacheMode::Normal, alloc).unwrap());
        let space = VirtualizedSpace::new();
        let base = space
            .map(AllocationPolicy::Fixed, 0, view, 0, PAGE_SIZE, Rights::READ | Rights::WRITE)
            .unwrap();
        assert_eq!(base, 0);
    }

    #[test]
    fn run_without_queued_exit_is_illegal_state() {
        let cpu = VirtualizedCpu::new(VirtualizedSpace::new());
        assert!(cpu.run().is_err());
        cpu.queue_exit(VmExitReason::Halted);
        assert_eq!(cpu.run().unwrap(), VmExitReason::Halted);
    }
}
