//! Address space: the virtual-to-view mapping table, hole allocation, fault
//! resolution, and cross-CPU TLB shootdown coordination.
//!
//! The mapping table is a `BTreeMap` keyed by page-aligned virtual address
//! directly rather than through a real page-table abstraction, and grants
//! resolve through a single `MemoryView` trait instead of a provider enum.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::cpu_set::{CpuSet, LogicalCpuId};
use crate::error::{HelError, HelResult};
use crate::memory::cow::CowView;
use crate::memory::{
    align_up, is_page_aligned, FetchOutcome, MemoryView, Observer, Rights, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Normal,
    Cow,
}

/// What `resolve_fault` saw: read/write/execute attempt against a mapped
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// How a free range should be chosen when no hint is provided or the hint
/// can't be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Must land exactly at the hinted address; fails otherwise.
    Fixed,
    /// Must land exactly at the hinted address and must not replace an
    /// existing mapping there.
    FixedNoReplace,
    /// Search downward from the top of the user region.
    PreferTop,
    /// Search upward from `mmap_min`.
    PreferBottom,
}

struct Mapping {
    base: usize,
    space: Weak<AddressSpace>,
    view: Arc<dyn MemoryView>,
    /// Present exactly when `kind == MappingKind::Cow`; kept alongside
    /// `view` (rather than downcast from it) so write faults can reach
    /// `CowView::resolve_write` without a trait-object downcast.
    cow: Option<Arc<CowView>>,
    offset_in_view: usize,
    len: usize,
    rights: Mutex<Rights>,
    kind: MappingKind,
}

impl Observer for Mapping {
    /// A mapping doesn't track the evicted sub-range; any eviction within
    /// its view invalidates the whole mapping, so it tears itself out of
    /// the table and kicks off a shootdown.
    fn on_evict(&self, _offset: usize, _len: usize) -> bool {
        if let Some(space) = self.space.upgrade() {
            if space.mappings.lock().remove(&self.base).is_some() {
                space.begin_shootdown();
            }
        }
        true
    }
}

/// Coordinates a TLB shootdown: every CPU the mapping was observed on must
/// acknowledge the current sequence number before the unmap completes.
pub struct ShootNode {
    sequence: u64,
    pending: CpuSet,
}

pub struct AddressSpace {
    mappings: Mutex<BTreeMap<usize, Arc<Mapping>>>,
    used_by: Mutex<CpuSet>,
    shoot_sequence: AtomicU64,
    shoot_pending: Mutex<Option<ShootNode>>,
    mmap_min: usize,
    user_end: usize,
}

impl AddressSpace {
    pub fn new(mmap_min: usize, user_end: usize) -> Arc<Self> {
        Arc::new(Self {
            mappings: Mutex::new(BTreeMap::new()),
            used_by: Mutex::new(CpuSet::new()),
            shoot_sequence: AtomicU64::new(0),
            shoot_pending: Mutex::new(None),
            mmap_min,
            user_end,
        })
    }

    pub fn note_active_on(&self, cpu: LogicalCpuId) {
        self.used_by.lock().add(cpu);
    }

    /// Find `len` contiguous unmapped bytes satisfying `policy`, starting
    /// from `hint` when the policy calls for it.
    pub fn find_free_range(&self, policy: AllocationPolicy, hint: usize, len: usize) -> HelResult<usize> {
        if len == 0 || !is_page_aligned(len) {
            return Err(HelError::IllegalArgs);
        }
        let mappings = self.mappings.lock();
        match policy {
            AllocationPolicy::Fixed | AllocationPolicy::FixedNoReplace => {
                if hint == 0 || !is_page_aligned(hint) {
                    return Err(HelError::IllegalArgs);
                }
                if policy == AllocationPolicy::FixedNoReplace && Self::overlaps(&mappings, hint, len) {
                    return Err(HelError::AlreadyExists);
                }
                Ok(hint)
            }
            AllocationPolicy::PreferBottom => {
                let mut cursor = core::cmp::max(hint, self.mmap_min);
                for (&base, mapping) in mappings.iter() {
                    if base >= cursor + len {
                        break;
                    }
                    if base + mapping.len > cursor {
                        cursor = align_up(base + mapping.len);
                    }
                }
                if cursor + len > self.user_end {
                    return Err(HelError::NoMemory);
                }
                Ok(cursor)
            }
            AllocationPolicy::PreferTop => {
                let mut cursor = self.user_end - len;
                for (&base, mapping) in mappings.iter().rev() {
                    let end = base + mapping.len;
                    if end <= cursor {
                        break;
                    }
                    if base < cursor + len {
                        if base < len {
                            return Err(HelError::NoMemory);
                        }
                        cursor = base - len;
                    }
                }
                if cursor < self.mmap_min {
                    return Err(HelError::NoMemory);
                }
                Ok(cursor)
            }
        }
    }

    fn overlaps(mappings: &BTreeMap<usize, Arc<Mapping>>, base: usize, len: usize) -> bool {
        mappings.iter().any(|(&mbase, mapping)| {
            let mend = mbase + mapping.len;
            mbase < base + len && base < mend
        })
    }

    pub fn map(
        self: &Arc<Self>,
        policy: AllocationPolicy,
        hint: usize,
        view: Arc<dyn MemoryView>,
        offset_in_view: usize,
        len: usize,
        rights: Rights,
    ) -> HelResult<usize> {
        self.map_inner(
            policy,
            hint,
            view,
            None,
            offset_in_view,
            len,
            rights,
            MappingKind::Normal,
        )
    }

    /// Map a copy-on-write view, keeping the concrete `CowView` handle
    /// around for write-fault resolution.
    pub fn map_cow(
        self: &Arc<Self>,
        policy: AllocationPolicy,
        hint: usize,
        view: Arc<CowView>,
        offset_in_view: usize,
        len: usize,
        rights: Rights,
    ) -> HelResult<usize> {
        let dyn_view: Arc<dyn MemoryView> = view.clone();
        self.map_inner(
            policy,
            hint,
            dyn_view,
            Some(view),
            offset_in_view,
            len,
            rights,
            MappingKind::Cow,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn map_inner(
        self: &Arc<Self>,
        policy: AllocationPolicy,
        hint: usize,
        view: Arc<dyn MemoryView>,
        cow: Option<Arc<CowView>>,
        offset_in_view: usize,
        len: usize,
        rights: Rights,
        kind: MappingKind,
    ) -> HelResult<usize> {
        if len == 0 || !is_page_aligned(len) || !is_page_aligned(offset_in_view) {
            return Err(HelError::IllegalArgs);
        }
        if offset_in_view.checked_add(len).ok_or(HelError::IllegalArgs)? > view.len() {
            return Err(HelError::OutOfBounds);
        }
        if !view.allowed_rights().contains(rights) {
            return Err(HelError::IllegalArgs);
        }
        let base = self.find_free_range(policy, hint, len)?;
        if policy == AllocationPolicy::Fixed {
            self.unmap(base, len).ok();
        }
        let mapping = Arc::new(Mapping {
            base,
            space: Arc::downgrade(self),
            view: view.clone(),
            cow,
            offset_in_view,
            len,
            rights: Mutex::new(rights),
            kind,
        });
        view.add_observer(Arc::downgrade(&mapping) as Weak<dyn Observer>);
        self.mappings.lock().insert(base, mapping);
        Ok(base)
    }

    /// Remove every mapping overlapping `[base, base+len)`, initiating a
    /// shootdown for any CPU that may have cached a translation.
    pub fn unmap(&self, base: usize, len: usize) -> HelResult<()> {
        if !is_page_aligned(base) || !is_page_aligned(len) {
            return Err(HelError::IllegalArgs);
        }
        let removed: alloc::vec::Vec<Arc<Mapping>> = {
            let mut mappings = self.mappings.lock();
            let keys: alloc::vec::Vec<usize> = mappings
                .range(..)
                .filter(|(&mbase, mapping)| mbase < base + len && base < mbase + mapping.len)
                .map(|(&mbase, _)| mbase)
                .collect();
            keys.into_iter().filter_map(|key| mappings.remove(&key)).collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        for mapping in &removed {
            mapping
                .view
                .remove_observer(&(Arc::downgrade(mapping) as Weak<dyn Observer>));
        }
        self.begin_shootdown();
        Ok(())
    }

    pub fn protect(&self, base: usize, len: usize, rights: Rights) -> HelResult<()> {
        if !is_page_aligned(base) || !is_page_aligned(len) {
            return Err(HelError::IllegalArgs);
        }
        let mappings = self.mappings.lock();
        let mapping = mappings.get(&base).ok_or(HelError::OutOfBounds)?;
        if mapping.len != len {
            return Err(HelError::IllegalArgs);
        }
        if !mapping.view.allowed_rights().contains(rights) {
            return Err(HelError::IllegalArgs);
        }
        *mapping.rights.lock() = rights;
        drop(mappings);
        self.begin_shootdown();
        Ok(())
    }

    /// Force writeback of every dirty page in `[base, base+len)`.
    pub fn synchronize(&self, base: usize, len: usize) -> HelResult<()> {
        let mappings = self.mappings.lock();
        let mapping = mappings.get(&base).ok_or(HelError::OutOfBounds)?;
        if len > mapping.len {
            return Err(HelError::IllegalArgs);
        }
        mapping.view.mark_dirty(mapping.offset_in_view, len);
        Ok(())
    }

    /// Resolve a fault at `addr`. A write fault against a `Cow` mapping
    /// populates a private page in the topmost chain node instead of
    /// delegating to the shared view.
    pub fn resolve_fault(&self, addr: usize, access: AccessMode) -> HelResult<FetchOutcome> {
        let mappings = self.mappings.lock();
        let (&base, mapping) = mappings
            .range(..=addr)
            .next_back()
            .filter(|(&base, mapping)| addr < base + mapping.len)
            .ok_or(HelError::Fault)?;

        let required = match access {
            AccessMode::Read => Rights::READ,
            AccessMode::Write => Rights::WRITE,
            AccessMode::Execute => Rights::EXECUTE,
        };
        if !mapping.rights.lock().contains(required) {
            return Err(HelError::Fault);
        }

        let offset = mapping.offset_in_view + (addr - base);
        if access == AccessMode::Write {
            if let Some(cow) = mapping.cow.as_ref() {
                let frame = cow.resolve_write(offset)?;
                return Ok(FetchOutcome::Ready(crate::memory::ResolvedSegment {
                    physical: frame,
                    len: PAGE_SIZE - (offset % PAGE_SIZE),
                    cache: mapping.view.cache_mode(),
                }));
            }
        }
        mapping.view.fetch_range(offset)
    }

    /// Bump the shootdown sequence and mark every CPU this space has run on
    /// as pending an acknowledgement.
    fn begin_shootdown(&self) {
        let sequence = self.shoot_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = *self.used_by.lock();
        *self.shoot_pending.lock() = Some(ShootNode { sequence, pending });
    }

    /// Called by a CPU after it has flushed its TLB in response to a
    /// shootdown; once every marked CPU has acknowledged, the pending node
    /// is cleared.
    pub fn ack_shootdown(&self, cpu: LogicalCpuId, sequence: u64) {
        let mut guard = self.shoot_pending.lock();
        if let Some(node) = guard.as_mut() {
            if node.sequence == sequence {
                node.pending.remove(cpu);
                if node.pending == CpuSet::new() {
                    *guard = None;
                }
            }
        }
    }

    pub fn shootdown_outstanding(&self) -> bool {
        self.shoot_pending.lock().is_some()
    }

    /// CPUs that still haven't acknowledged the outstanding shootdown, if any.
    pub fn pending_shootdown_cpus(&self) -> arrayvec::ArrayVec<LogicalCpuId, { crate::cpu_set::CPU_COUNT }> {
        match self.shoot_pending.lock().as_ref() {
            Some(node) => node.pending.iter(),
            None => arrayvec::ArrayVec::new(),
        }
    }
}
