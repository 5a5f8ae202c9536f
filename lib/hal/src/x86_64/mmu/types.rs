//! MMU type definitions for x86-64.
//!
//! `PtElement` is a page-table entry as a plain 64-bit value; `Ptep` is a
//! pointer to an entry slot with atomic access. Concurrent fault handling
//! relies on installing leaf entries with a compare-exchange against the
//! empty entry, so every slot access goes through `Ptep`.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::constants::{phys_to_virt, ENTRIES_PER_TABLE};
use super::MmuError;
use crate::mem::constants::PAGE_SIZE;
use crate::traits::page_allocator;

// ============================================================================
// Page Table Entry Flags
// ============================================================================

bitflags! {
    /// x86-64 page table entry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is valid (bit 0)
        const PRESENT = 1 << 0;
        /// Writes allowed (bit 1)
        const WRITABLE = 1 << 1;
        /// User-mode access allowed (bit 2); unused in a unikernel
        const USER = 1 << 2;
        /// Write-through caching (bit 3)
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (bit 4); used for device memory
        const CACHE_DISABLE = 1 << 4;
        /// Accessed (bit 5, hardware-set)
        const ACCESSED = 1 << 5;
        /// Dirty (bit 6, hardware-set; also set by software at map time)
        const DIRTY = 1 << 6;
        /// Large page (bit 7, meaningful at levels 1 and 2)
        const LARGE = 1 << 7;
        /// Global mapping (bit 8)
        const GLOBAL = 1 << 8;
        /// Software: copy-on-write page (bit 9, ignored by hardware)
        const SW_COW = 1 << 9;
        /// Reserved physical-address bit used to encode a PROT_NONE
        /// mapping: any access faults with the RSVD error bit set.
        const RSVD_NO_ACCESS = 1 << 51;
        /// No-execute (bit 63)
        const NX = 1 << 63;
    }
}

/// Bits 12..51 hold the physical frame address.
const ADDR_MASK: u64 = 0x0007_ffff_ffff_f000;

/// Memory attribute for a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mattr {
    /// Ordinary write-back cacheable RAM
    Normal,
    /// Device memory, uncached
    Device,
}

// ============================================================================
// Page Table Entry value
// ============================================================================

/// A 64-bit page table entry, handled by value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtElement(u64);

impl PtElement {
    /// The empty (invalid, all-zero) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct from a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True if no bits are set at all. An empty entry is the CAS anchor for
    /// concurrent installs; a non-empty invalid entry (PROT_NONE) is not.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn valid(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }

    #[inline]
    pub const fn executable(self) -> bool {
        self.0 & PteFlags::NX.bits() == 0
    }

    #[inline]
    pub const fn dirty(self) -> bool {
        self.0 & PteFlags::DIRTY.bits() != 0
    }

    #[inline]
    pub const fn large(self) -> bool {
        self.0 & PteFlags::LARGE.bits() != 0
    }

    #[inline]
    pub const fn cow(self) -> bool {
        self.0 & PteFlags::SW_COW.bits() != 0
    }

    #[inline]
    pub const fn no_access(self) -> bool {
        self.0 & PteFlags::RSVD_NO_ACCESS.bits() != 0
    }

    /// Physical address this entry points at (frame or next-level table).
    #[inline]
    pub const fn addr(self) -> usize {
        (self.0 & ADDR_MASK) as usize
    }

    #[inline]
    pub fn set_addr(&mut self, pa: usize) {
        self.0 = (self.0 & !ADDR_MASK) | (pa as u64 & ADDR_MASK);
    }

    #[inline]
    pub fn set_valid(&mut self, v: bool) {
        self.set(PteFlags::PRESENT, v);
    }

    #[inline]
    pub fn set_writable(&mut self, v: bool) {
        self.set(PteFlags::WRITABLE, v);
    }

    #[inline]
    pub fn set_executable(&mut self, v: bool) {
        self.set(PteFlags::NX, !v);
    }

    #[inline]
    pub fn set_dirty(&mut self, v: bool) {
        self.set(PteFlags::DIRTY, v);
    }

    #[inline]
    pub fn set_large(&mut self, v: bool) {
        self.set(PteFlags::LARGE, v);
    }

    /// Mark as copy-on-write. A COW page must never be writable.
    #[inline]
    pub fn set_cow(&mut self, v: bool) {
        if v {
            self.set_writable(false);
        }
        self.set(PteFlags::SW_COW, v);
    }

    #[inline]
    pub fn set_no_access(&mut self, v: bool) {
        self.set(PteFlags::RSVD_NO_ACCESS, v);
    }

    #[inline]
    fn set(&mut self, flag: PteFlags, v: bool) {
        if v {
            self.0 |= flag.bits();
        } else {
            self.0 &= !flag.bits();
        }
    }

    /// Flags view of the entry.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

/// Build the empty entry.
#[inline]
pub const fn make_empty_pte() -> PtElement {
    PtElement::empty()
}

/// Build a leaf entry at `level` mapping `pa`.
///
/// Levels above 0 get the LARGE bit. Execution is the absence of NX.
pub fn make_leaf_pte(level: usize, pa: usize, writable: bool, executable: bool, mattr: Mattr) -> PtElement {
    let mut flags = PteFlags::PRESENT;
    if writable {
        flags |= PteFlags::WRITABLE;
    }
    if !executable {
        flags |= PteFlags::NX;
    }
    if level > 0 {
        flags |= PteFlags::LARGE;
    }
    if matches!(mattr, Mattr::Device) {
        flags |= PteFlags::CACHE_DISABLE;
    }
    let mut pte = PtElement(flags.bits());
    pte.set_addr(pa);
    pte
}

/// Build an intermediate entry pointing at the table page `pa`.
///
/// Intermediate entries are maximally permissive; the leaf decides.
pub fn make_intermediate_pte(pa: usize) -> PtElement {
    let mut pte = PtElement((PteFlags::PRESENT | PteFlags::WRITABLE).bits());
    pte.set_addr(pa);
    pte
}

// ============================================================================
// Page Table Entry pointer
// ============================================================================

/// Pointer to one page-table entry slot, with atomic access.
///
/// Copyable and passed by value through the walker, like a bare pointer.
#[derive(Clone, Copy, Debug)]
pub struct Ptep(*mut u64);

impl Ptep {
    /// Wrap a raw slot pointer.
    ///
    /// # Safety
    /// `slot` must point at an 8-byte-aligned entry inside a live page
    /// table (or root slot) for as long as this `Ptep` is used.
    #[inline]
    pub const unsafe fn from_raw(slot: *mut u64) -> Self {
        Self(slot)
    }

    #[inline]
    fn atomic(self) -> &'static AtomicU64 {
        // SAFETY: constructor contract; AtomicU64 is layout-compatible
        // with u64 and the slot outlives every walker that can reach it
        // (intermediate tables are only reclaimed through an RCU grace
        // period).
        unsafe { &*(self.0 as *const AtomicU64) }
    }

    /// Atomically read the entry.
    #[inline]
    pub fn read(self) -> PtElement {
        PtElement(self.atomic().load(Ordering::Acquire))
    }

    /// Volatile low-level read, for lock-free RCU-side visitors.
    #[inline]
    pub fn ll_read(self) -> PtElement {
        // SAFETY: constructor contract.
        PtElement(unsafe { core::ptr::read_volatile(self.0) })
    }

    /// Atomically overwrite the entry.
    #[inline]
    pub fn write(self, pte: PtElement) {
        self.atomic().store(pte.raw(), Ordering::Release);
    }

    /// Install `new` only if the entry still reads `expected`.
    /// Returns whether the install happened.
    #[inline]
    pub fn compare_exchange(self, expected: PtElement, new: PtElement) -> bool {
        self.atomic()
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// A Ptep travels with walkers that may run from any CPU; the pointee is
// only ever accessed atomically.
unsafe impl Send for Ptep {}
unsafe impl Sync for Ptep {}

// ============================================================================
// Page Table node
// ============================================================================

/// A 4 KiB-aligned page table with 512 entries.
///
/// Entries are atomics: walkers on different CPUs index the same node
/// concurrently through shared references, and every slot access goes
/// through [`Ptep`].
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (static early tables).
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        }
    }

    /// Allocate a zeroed table node from the global page allocator;
    /// returns its physical address.
    pub fn alloc() -> Result<usize, MmuError> {
        let pa = page_allocator()
            .alloc_page()
            .ok_or(MmuError::AllocationFailed)?;
        // SAFETY: fresh table page, visible through the direct map.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa) as *mut u8, 0, PAGE_SIZE);
        }
        Ok(pa)
    }

    /// Borrow the table node at physical address `pa`.
    ///
    /// # Safety
    /// `pa` must point at a live table page, and the page must stay live
    /// for `'a` (intermediate tables are only reclaimed through an RCU
    /// grace period).
    #[inline]
    pub unsafe fn from_pa<'a>(pa: usize) -> &'a PageTable {
        &*(phys_to_virt(pa) as *const PageTable)
    }

    /// Entry slot at `index`.
    #[inline]
    pub fn slot(&self, index: usize) -> Ptep {
        debug_assert!(index < ENTRIES_PER_TABLE);
        // SAFETY: index is in bounds and the table is live.
        unsafe { Ptep::from_raw(self.entries[index].as_ptr()) }
    }

    /// Check whether every entry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.load(Ordering::Relaxed) == 0)
    }
}
