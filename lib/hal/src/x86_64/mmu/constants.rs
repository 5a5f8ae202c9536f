//! MMU constants for x86-64.
//!
//! Table geometry, the kernel direct-map window, and virtual address index
//! extraction for the 4-level / 48-bit / 4 KiB-granule format.

use crate::mem::constants::{PAGE_SHIFT, PAGE_SIZE};

/// Entries per page table (512 for 4 KiB pages with 8-byte entries)
pub const ENTRIES_PER_TABLE: usize = 512;

/// log2 of ENTRIES_PER_TABLE
pub const PTE_PER_PAGE_SHIFT: usize = 9;

/// Number of page-table levels (0 = leaf .. 3 = root table)
pub const NR_PT_LEVELS: usize = 4;

/// Number of leaf page sizes the walker may use (4 KiB and 2 MiB).
/// 1 GiB pages would make this 3; they are not supported.
pub const NR_PAGE_SIZES: usize = 2;

/// Base of the kernel direct map of physical memory ("phys_mem" window).
/// Every byte of RAM is visible at `PHYS_MEM_BASE + pa`.
pub const PHYS_MEM_BASE: usize = 0xffff_8000_0000_0000;

/// Convert a physical address to its direct-map virtual address.
///
/// Host-test builds have no direct map; translation is the identity so page
/// tables can live in ordinary heap memory.
#[inline]
pub const fn phys_to_virt(pa: usize) -> usize {
    #[cfg(any(feature = "std", test))]
    {
        pa
    }
    #[cfg(not(any(feature = "std", test)))]
    {
        PHYS_MEM_BASE + pa
    }
}

/// Convert a direct-map virtual address back to its physical address.
#[inline]
pub const fn virt_to_phys(va: usize) -> usize {
    #[cfg(any(feature = "std", test))]
    {
        va
    }
    #[cfg(not(any(feature = "std", test)))]
    {
        va - PHYS_MEM_BASE
    }
}

/// Shift of one entry's coverage at `level` (12, 21, 30, 39).
#[inline]
pub const fn level_shift(level: usize) -> usize {
    PAGE_SHIFT + level * PTE_PER_PAGE_SHIFT
}

/// Bytes covered by one entry at `level` (4 KiB, 2 MiB, 1 GiB, 512 GiB).
#[inline]
pub const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

/// Extract the table index for `va` at `level`.
#[inline]
pub const fn pt_index(va: usize, level: usize) -> usize {
    (va >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

/// 1's for the address bits a leaf entry at `level` provides,
/// 0's for the bits taken from the virtual address.
#[inline]
pub const fn pte_level_mask(level: usize) -> usize {
    !(level_size(level) - 1)
}

/// Sign-extend bit 47 to produce a canonical 48-bit virtual address.
#[inline]
pub const fn sign_extend_47(va: usize) -> usize {
    (((va as i64) << 16) >> 16) as usize
}

/// Sanity: an entry at level 0 covers exactly one page.
const _: () = assert!(level_size(0) == PAGE_SIZE);
