// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host simulation of the machine.
//!
//! There is no user mode here: a "thread" is its saved register file, which
//! tests fill in with `SavedState::set_arg` before making a syscall on its
//! behalf. Page tables are plain maps, and physical memory is a byte vector.

use std::collections::BTreeMap;

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{Rights, ThreadId};

use crate::atomic::AtomicExt;
use crate::space::{AddressSpaceOps, PageTableError, Translation};
use crate::startup::{PAGE_SHIFT, PHYS_FRAMES, SUPERPAGE_SHIFT};

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Number of syscall argument registers.
pub const ARG_REGS: usize = 12;
/// Number of syscall result registers.
pub const RET_REGS: usize = 6;

#[derive(Default, Debug, Clone)]
pub struct SavedState {
    args: [u32; ARG_REGS],
    rets: [u32; RET_REGS],
    pc: u32,
    sp: u32,
}

impl SavedState {
    /// Loads syscall argument register `i`, as user code would before
    /// trapping. Registers past the last are ignored.
    pub fn set_arg(&mut self, i: usize, value: u32) {
        if let Some(r) = self.args.get_mut(i) {
            *r = value;
        }
    }

    /// Reads result register `i` after a syscall.
    pub fn ret(&self, i: usize) -> u32 {
        self.rets.get(i).copied().unwrap_or(0)
    }

    pub fn rets(&self) -> [u32; RET_REGS] {
        self.rets
    }
}

impl crate::thread::ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.sp
    }

    fn program_counter(&self) -> u32 {
        self.pc
    }

    fn set_entry_point(&mut self, pc: u32, sp: u32) {
        uassert!(sp & 0x3 == 0);
        *self = Self {
            pc,
            sp,
            ..Self::default()
        };
    }

    fn arg0(&self) -> u32 {
        self.args[0]
    }
    fn arg1(&self) -> u32 {
        self.args[1]
    }
    fn arg2(&self) -> u32 {
        self.args[2]
    }
    fn arg3(&self) -> u32 {
        self.args[3]
    }
    fn arg4(&self) -> u32 {
        self.args[4]
    }
    fn arg5(&self) -> u32 {
        self.args[5]
    }
    fn arg6(&self) -> u32 {
        self.args[6]
    }
    fn arg7(&self) -> u32 {
        self.args[7]
    }
    fn arg8(&self) -> u32 {
        self.args[8]
    }
    fn arg9(&self) -> u32 {
        self.args[9]
    }
    fn arg10(&self) -> u32 {
        self.args[10]
    }
    fn arg11(&self) -> u32 {
        self.args[11]
    }

    fn ret0(&mut self, x: u32) {
        self.rets[0] = x;
    }
    fn ret1(&mut self, x: u32) {
        self.rets[1] = x;
    }
    fn ret2(&mut self, x: u32) {
        self.rets[2] = x;
    }
    fn ret3(&mut self, x: u32) {
        self.rets[3] = x;
    }
    fn ret4(&mut self, x: u32) {
        self.rets[4] = x;
    }
    fn ret5(&mut self, x: u32) {
        self.rets[5] = x;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Entry {
    phys: u32,
    size_log2: u8,
    rights: Rights,
}

/// Software page table, keyed by the virtual base of each entry.
#[derive(Default, Debug)]
pub struct PageTable {
    entries: BTreeMap<u32, Entry>,
}

impl PageTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn translation(virt: u32, e: &Entry) -> Translation {
        Translation {
            virt,
            phys: e.phys,
            size_log2: e.size_log2,
            rights: e.rights,
        }
    }
}

impl AddressSpaceOps for PageTable {
    fn map(
        &mut self,
        virt: u32,
        phys: u32,
        size_log2: u8,
        rights: Rights,
    ) -> Result<(), PageTableError> {
        if size_log2 != PAGE_SHIFT && size_log2 != SUPERPAGE_SHIFT {
            return Err(PageTableError::BadSize);
        }
        let mask = (1u32 << size_log2) - 1;
        if virt & mask != 0 || phys & mask != 0 {
            return Err(PageTableError::Misaligned);
        }
        if let Some(e) = self.entries.get_mut(&virt) {
            if e.phys == phys && e.size_log2 == size_log2 {
                e.rights = rights;
                return Ok(());
            }
        }
        let end = u64::from(virt) + (1u64 << size_log2);
        if self.next_mapping(virt, end).is_some() {
            return Err(PageTableError::Occupied);
        }
        self.entries.insert(
            virt,
            Entry {
                phys,
                size_log2,
                rights,
            },
        );
        Ok(())
    }

    fn unmap(
        &mut self,
        virt: u32,
        size_log2: u8,
    ) -> Result<Translation, PageTableError> {
        match self.entries.get(&virt) {
            Some(e) if e.size_log2 == size_log2 => {
                let t = Self::translation(virt, e);
                self.entries.remove(&virt);
                Ok(t)
            }
            _ => Err(PageTableError::NotMapped),
        }
    }

    fn protect(
        &mut self,
        virt: u32,
        rights: Rights,
    ) -> Result<(), PageTableError> {
        let base = self.lookup(virt).ok_or(PageTableError::NotMapped)?.virt;
        let e = self
            .entries
            .get_mut(&base)
            .ok_or(PageTableError::NotMapped)?;
        e.rights = rights;
        Ok(())
    }

    fn lookup(&self, virt: u32) -> Option<Translation> {
        let (&base, e) = self.entries.range(..=virt).next_back()?;
        let t = Self::translation(base, e);
        (u64::from(virt) < t.end()).then_some(t)
    }

    fn next_mapping(&self, from: u32, end: u64) -> Option<Translation> {
        if let Some(t) = self.lookup(from) {
            return Some(t);
        }
        let (&base, e) = self.entries.range(from..).next()?;
        (u64::from(base) < end).then(|| Self::translation(base, e))
    }
}

/// Simulated physical memory: `PHYS_FRAMES` pages starting at address 0.
pub struct PhysMemory {
    bytes: Vec<u8>,
}

impl Default for PhysMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMemory {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; PHYS_FRAMES << PAGE_SHIFT],
        }
    }

    /// Bytes of physical memory, which is also one past the highest address.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn slice(&self, phys: u32, len: usize) -> Option<&[u8]> {
        let start = phys as usize;
        self.bytes.get(start..start.checked_add(len)?)
    }

    pub fn slice_mut(&mut self, phys: u32, len: usize) -> Option<&mut [u8]> {
        let start = phys as usize;
        self.bytes.get_mut(start..start.checked_add(len)?)
    }
}

/// Hands the CPU to `next`. In simulation there is nothing to restore, so
/// this only records the switch.
pub fn switch_to(next: ThreadId) {
    log::trace!("switch to {next:?}");
}

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Runs `f` with (simulated) interrupts masked, restoring the previous mask
/// afterwards.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = INTERRUPTS_ENABLED.swap_polyfill(false, Ordering::SeqCst);
    let r = f();
    INTERRUPTS_ENABLED.store(was_enabled, Ordering::SeqCst);
    r
}

impl AtomicExt for AtomicBool {
    type Primitive = bool;

    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        self.swap(value, ordering)
    }

    fn compare_swap_polyfill(
        &self,
        current: Self::Primitive,
        new: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        match self.compare_exchange(current, new, ordering, Ordering::Relaxed)
        {
            Ok(v) | Err(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 1 << PAGE_SHIFT;
    const SUPER: u32 = 1 << SUPERPAGE_SHIFT;

    #[test]
    fn page_table_refuses_overlap_and_misalignment() {
        let mut pt = PageTable::default();
        pt.map(SUPER, 0, SUPERPAGE_SHIFT, Rights::RW).unwrap();
        assert_eq!(
            pt.map(SUPER + PAGE, PAGE, PAGE_SHIFT, Rights::RW),
            Err(PageTableError::Occupied)
        );
        assert_eq!(
            pt.map(PAGE, 0, SUPERPAGE_SHIFT, Rights::RW),
            Err(PageTableError::Misaligned)
        );
        assert_eq!(
            pt.map(0, 0, PAGE_SHIFT + 1, Rights::RW),
            Err(PageTableError::BadSize)
        );
        // Re-mapping the same thing just changes rights.
        pt.map(SUPER, 0, SUPERPAGE_SHIFT, Rights::READ).unwrap();
        assert_eq!(pt.lookup(SUPER + 5).unwrap().rights, Rights::READ);
    }

    #[test]
    fn lookup_and_next_mapping_find_covering_entries() {
        let mut pt = PageTable::default();
        pt.map(0, 0x1000, PAGE_SHIFT, Rights::RW).unwrap();
        pt.map(SUPER, 0, SUPERPAGE_SHIFT, Rights::RW).unwrap();

        assert_eq!(pt.lookup(0x10).unwrap().phys_for(0x10), 0x1010);
        assert!(pt.lookup(PAGE).is_none());
        assert_eq!(pt.next_mapping(PAGE, u64::from(SUPER)), None);
        assert_eq!(
            pt.next_mapping(PAGE, u64::from(SUPER) + 1).unwrap().virt,
            SUPER
        );
        assert_eq!(pt.next_mapping(SUPER + PAGE, 1 << 32).unwrap().virt, SUPER);

        assert_eq!(
            pt.unmap(SUPER, PAGE_SHIFT),
            Err(PageTableError::NotMapped),
            "size must match the entry"
        );
        pt.unmap(SUPER, SUPERPAGE_SHIFT).unwrap();
        assert_eq!(pt.len(), 1);
    }

    #[test]
    fn phys_memory_bounds() {
        let mut m = PhysMemory::new();
        assert!(m.slice(0, m.len()).is_some());
        assert!(m.slice(1, m.len()).is_none());
        m.slice_mut(0x10, 2).unwrap().copy_from_slice(&[1, 2]);
        assert_eq!(m.slice(0x10, 2).unwrap(), &[1, 2]);
    }

    #[test]
    fn interrupt_mask_nests() {
        let r = with_interrupts_disabled(|| with_interrupts_disabled(|| 7) + 1);
        assert_eq!(r, 8);
    }
}
