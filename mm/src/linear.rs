//! Kernel linear mappings.
//!
//! A linear VMA is a 1:1 virtual-to-physical region in the high half,
//! mapped eagerly and registered in its own ordered set so no user mapping
//! may land on top of it. Linear VMAs live outside the superblock-
//! partitioned index.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;

use aos_hal::mem::PAGE_SIZE;
use aos_hal::mmu::{level_size, Mattr, MmuError, NR_PAGE_SIZES, PHYS_MEM_BASE};
use aos_utils::RwLock;

use crate::pt::{map_range, LinearPageMapperOp, PageTableRoot};
use crate::VmError;

/// One kernel linear mapping.
pub struct LinearVma {
    virt: usize,
    phys: usize,
    size: usize,
    mattr: Mattr,
    name: &'static str,
}

impl LinearVma {
    #[must_use]
    pub fn virt(&self) -> usize {
        self.virt
    }

    #[must_use]
    pub fn phys(&self) -> usize {
        self.phys
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

static LINEAR_VMAS: RwLock<BTreeMap<usize, LinearVma>> = RwLock::new(BTreeMap::new());

/// Map `[virt, virt + size)` 1:1 onto `[phys, phys + size)` with the given
/// attributes, eagerly populating every level.
///
/// `slop` allows rounding the walk out to a larger granule so whole 2 MiB
/// entries can be used; it is capped at the largest supported page size.
/// The covered ranges are removed from the owning workers' free maps, so
/// no user mapping can be placed there.
pub fn linear_map(
    root: &PageTableRoot,
    virt: usize,
    phys: usize,
    size: usize,
    name: &'static str,
    slop: usize,
    mattr: Mattr,
) -> Result<(), VmError> {
    let slop = core::cmp::min(slop, level_size(NR_PAGE_SIZES - 1));
    // Both sides must sit at the same offset within the mapping granule,
    // or no leaf of that granule can cover them 1:1.
    if virt & (slop - 1) != phys & (slop - 1) {
        return Err(MmuError::Misaligned.into());
    }

    let mut op = LinearPageMapperOp::new(phys, size, mattr);
    map_range(&mut op, root, virt, virt, size, slop)?;

    LINEAR_VMAS.write().insert(
        virt,
        LinearVma {
            virt,
            phys,
            size,
            mattr,
            name,
        },
    );

    // Pull the range out of the free maps of every worker it crosses.
    let sbm = crate::sb_mgr();
    for (seg_start, seg_size, owner) in sbm.generate_owner_list(virt, size) {
        let worker = sbm.worker_by_index(owner as usize);
        worker.free_ranges.write().allocate(seg_start, seg_size);
    }

    log::trace!("[LINEAR] {name}: {virt:#x} -> {phys:#x} ({size:#x} bytes)");
    Ok(())
}

/// Whether `[addr, addr + size)` lies entirely inside kernel linear
/// mappings (the direct map or a registered linear VMA).
pub fn is_linear_mapped(addr: usize, size: usize) -> bool {
    if addr >= PHYS_MEM_BASE {
        return true;
    }
    let vmas = LINEAR_VMAS.read();
    if let Some((_, vma)) = vmas.range(..=addr).next_back() {
        return addr >= vma.virt && addr + size <= vma.virt + vma.size;
    }
    false
}

/// Render the linear-map registry, one line per mapping, with an `n`/`d`
/// memory-attribute tag.
pub fn sysfs_linear_maps() -> String {
    let mut out = String::new();
    let vmas = LINEAR_VMAS.read();
    for vma in vmas.values() {
        let attr = match vma.mattr {
            Mattr::Normal => 'n',
            Mattr::Device => 'd',
        };
        out += &format!(
            "{:>18x} {:>18x} {:>12x} rwxp {} {}\n",
            vma.virt, vma.phys, vma.size, attr, vma.name
        );
    }
    out
}

const _: () = assert!(PAGE_SIZE == level_size(0));
