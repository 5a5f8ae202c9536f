//! User address-space geometry.
//!
//! The user mapping area is `[0, UPPER_VMA_LIMIT)`. Its upper part,
//! `[SUPERBLOCK_AREA_BASE, UPPER_VMA_LIMIT)`, is carved into fixed-size
//! superblocks that CPUs claim for contention-free virtual allocation.
//! Everything below the superblock area and everything at or above
//! `MAIN_MEM_AREA_BASE` (the kernel half, including the physical direct
//! map) belongs to the out-of-band kernel worker.

/// Beginning of the first user mapping byte.
pub const LOWER_VMA_LIMIT: usize = 0;

/// First byte after the user mapping area (64 TiB).
pub const UPPER_VMA_LIMIT: usize = 0x4000_0000_0000;

/// Beginning of the superblock-partitioned region (16 TiB).
pub const SUPERBLOCK_AREA_BASE: usize = 0x1000_0000_0000;

/// First byte after the superblock area; start of kernel-owned addresses.
pub const MAIN_MEM_AREA_BASE: usize = UPPER_VMA_LIMIT;

/// Size of one superblock (1 GiB): the unit of CPU ownership.
pub const SUPERBLOCK_SIZE: usize = 1 << 30;

/// Number of superblocks in the superblock area.
pub const SUPERBLOCK_COUNT: usize = (MAIN_MEM_AREA_BASE - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE;

/// Upper limit of CPUs the VMM can be initialized with.
pub const MAX_CPUS: usize = 64;

/// One worker per CPU plus the kernel worker for out-of-area addresses.
pub const NR_WORKERS: usize = MAX_CPUS + 1;

/// Index of the worker owning everything outside the superblock area.
pub const KERNEL_WORKER: usize = MAX_CPUS;

/// Ownership-cell value for an unclaimed superblock.
pub const SUPERBLOCK_FREE: u8 = 255;

/// Default search base for non-fixed mappings with no hint (32 TiB).
pub const MMAP_SEARCH_BASE: usize = 0x2000_0000_0000;

/// Index of the superblock containing `addr`.
#[inline]
pub const fn superblock_index(addr: usize) -> usize {
    (addr - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE
}

/// First address of superblock `index`.
#[inline]
pub const fn superblock_addr(index: usize) -> usize {
    SUPERBLOCK_AREA_BASE + index * SUPERBLOCK_SIZE
}

/// Whether `addr` lies inside the superblock-partitioned region.
#[inline]
pub const fn in_superblock_area(addr: usize) -> bool {
    addr >= SUPERBLOCK_AREA_BASE && addr < MAIN_MEM_AREA_BASE
}

/// Whether `addr` lies in the user mapping area at all.
#[inline]
pub const fn in_vma_range(addr: usize) -> bool {
    // The user half of the canonical address space.
    (addr as isize) >= 0
}

/// First superblock boundary strictly after `addr`.
#[inline]
pub const fn superblock_boundary_after(addr: usize) -> usize {
    (addr / SUPERBLOCK_SIZE + 1) * SUPERBLOCK_SIZE
}
