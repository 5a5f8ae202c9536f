//! AuroraOS virtual memory manager.
//!
//! Maintains the process-wide virtual address space of the unikernel:
//! the per-CPU partitioned VMA index, the hardware page tables, and the
//! mmap-family operations built on them.
//!
//! # Structure
//!
//! - `layout`: address-space geometry (superblock area, worker count)
//! - `ranges` / `store`: free-range maps, per-CPU workers, superblock cells
//! - `vma` / `provider` / `file`: mappings and their backing policies
//! - `pt`: the page-table walker and its operation family
//! - `fault` / `api` / `linear`: the entry points
//!
//! Host tests run with the HAL's `std` feature (pulled in through
//! dev-dependencies), which makes phys/virt translation the identity so
//! page tables live in plain heap memory.

#![no_std]

extern crate alloc;

pub mod api;
pub mod fault;
pub mod file;
pub mod layout;
pub mod linear;
pub mod pt;
pub mod provider;
pub mod ranges;
pub mod store;
pub mod vma;

#[cfg(test)]
mod testutil;

use aos_error::define_kernel_error;
use aos_hal::mmu::MmuError;
use aos_utils::Once;

use crate::pt::PageTableRoot;
use crate::store::SuperblockManager;

define_kernel_error! {
    /// VMM error type (class 0x02).
    pub enum VmError(0x02) {
        /// No free virtual range of the requested size
        OutOfVirtualSpace = 0x01 => "out of virtual address space",
        /// Physical page allocation failed
        OutOfMemory = 0x02 => "out of physical memory",
        /// Address range not (fully) mapped
        NotMapped = 0x03 => "address range not mapped",
        /// Malformed request
        InvalidArgument = 0x04 => "invalid argument",
        /// File access mode does not admit the mapping
        AccessDenied = 0x05 => "file access mode mismatch",
        /// Executable mapping on a no-exec mount
        NotPermitted = 0x06 => "operation not permitted",
        /// File I/O failed during write-back
        IoError = 0x07 => "file I/O failed",
    }
}

/// HAL errors crossing into the VMM keep their meaning but lose the
/// subsystem distinction the callers of this crate do not care about.
impl From<MmuError> for VmError {
    fn from(err: MmuError) -> Self {
        match err {
            MmuError::AllocationFailed => VmError::OutOfMemory,
            MmuError::Misaligned => VmError::InvalidArgument,
        }
    }
}

pub use api::{
    all_vmas_size, ismapped, isreadable, madvise, map_anon, map_file, mincore, mprotect, msync,
    munmap, munmap_anon, procfs_maps, vcleanup, vdepopulate, virt_to_phys, vpopulate, Advice,
};
pub use fault::{vm_fault, FaultStatus};
pub use file::{FileStat, OpenMode, ShmFile, VmFile};
pub use linear::{is_linear_mapped, linear_map, sysfs_linear_maps};
pub use vma::{AddrRange, MmapFlags, Perm, Vma};

static SB_MGR: Once<SuperblockManager> = Once::new();
static ROOT_PT: Once<PageTableRoot> = Once::new();

/// Bring up the VMM: the superblock partition and the root page table.
/// Requires the HAL page allocator to be installed.
pub fn init() {
    SB_MGR.call_once(SuperblockManager::new);
    ROOT_PT.call_once(|| PageTableRoot::new().expect("root page table allocation at boot"));
}

/// The address-space partition. Panics before `init()`.
pub(crate) fn sb_mgr() -> &'static SuperblockManager {
    SB_MGR.get().expect("aos_mm::init not called")
}

/// The root page table. Panics before `init()`.
pub fn root() -> &'static PageTableRoot {
    ROOT_PT.get().expect("aos_mm::init not called")
}
