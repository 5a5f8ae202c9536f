//! Address-space operations.
//!
//! The mmap-family entry points and the range plumbing they share:
//! reserve/carve via the superblock manager, populate/unpopulate/protect
//! via the walker, all under the owning worker's locks.

use alloc::sync::Arc;

use aos_hal::mem::{is_page_aligned, page_align_down, page_align_up, PAGE_SIZE};
use aos_hal::mmu::ensure_next_two_stack_pages;
use aos_utils::Mutex;

use crate::fault;
use crate::file::VmFile;
use crate::linear;
use crate::pt::{
    operate_range, virt_to_phys_pt, CleanupIntermediateOp, DirtyCleanerOp, DirtyPageSync,
    PopulateOp, ProtectOp, SplitHugeOp, UnpopulateOp,
};
use crate::provider::ZeroedAnonymous;
use crate::store::{SuperblockManager, VmaList};
use crate::vma::{AddrRange, Backing, MmapFlags, Perm, Vma};
use crate::VmError;

/// madvise advice values the VMM understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    /// Drop the backing pages; the range stays mapped.
    DontNeed,
    /// Stop using huge pages for the range and break up existing ones.
    NoHugePage,
}

// Serialises mutations of kernel page tables outside any VMA.
static PAGE_TABLE_HIGH_MUTEX: Mutex<()> = Mutex::new(());

// ============================================================================
// Shared range plumbing
// ============================================================================

/// Populate a sub-range of one VMA through its provider.
///
/// Fails with `OutOfMemory` only when a 4 KiB allocation failed; a failed
/// 2 MiB allocation already fell back to small pages inside the walk.
pub(crate) fn populate_vma(vma: &Vma, addr: usize, size: usize, write: bool) -> Result<usize, VmError> {
    let provider = vma.page_ops();
    let mut op = if vma.has_flags(MmapFlags::SMALL) {
        PopulateOp::small(provider, vma.perm(), write, vma.map_dirty())
    } else {
        PopulateOp::new(provider, vma.perm(), write, vma.map_dirty())
    };
    let total = operate_range(&mut op, crate::root(), vma.start(), addr, size)?;
    if op.hard_oom() {
        return Err(VmError::OutOfMemory);
    }
    Ok(total)
}

/// msync one VMA over `[start, end)` (both inside the VMA).
pub(crate) fn sync_vma(vma: &Vma, start: usize, end: usize) -> Result<(), VmError> {
    let Backing::File {
        file,
        offset,
        cached,
        ..
    } = vma.backing()
    else {
        return Ok(());
    };
    if !vma.has_flags(MmapFlags::SHARED) {
        return Err(VmError::NotMapped);
    }

    let start = core::cmp::max(start, vma.start());
    let end = core::cmp::min(end, vma.end());

    if !*cached {
        // No shared page cache below us: find the dirty pages and write
        // them back ourselves.
        let fsize = file.stat()?.size;
        let handler = DirtyPageSync::new(&**file, *offset, fsize);
        let mut op = DirtyCleanerOp::new(handler);
        let cleaned = operate_range(&mut op, crate::root(), vma.start(), start, end - start)?;
        if cleaned != 0 {
            file.fsync()?;
        }
        return Ok(());
    }

    // The file owns the pages; let it flush them.
    file.sync_range(
        offset + (start - vma.start()) as u64,
        offset + (end - vma.start()) as u64,
    )?;
    file.fsync()
}

/// Unpopulate a whole VMA, return its range to the owning worker's free
/// map, and destroy it. Caller holds the worker's VMA lock for write and
/// has already removed the VMA from the index.
fn evacuate_vma(sbm: &SuperblockManager, vma: Vma) -> usize {
    let mut op = UnpopulateOp::new(vma.page_ops());
    let freed = operate_range(&mut op, crate::root(), vma.start(), vma.start(), vma.size())
        .unwrap_or(0);
    sbm.free_ranges_lock(vma.start())
        .write()
        .free(vma.start(), vma.size());
    freed
}

/// Evacuate every VMA fully contained in `[start, end)`, splitting the
/// boundary VMAs first. Caller holds the worker's VMA lock for write.
fn evacuate_locked(sbm: &SuperblockManager, list: &mut VmaList, start: usize, end: usize) -> usize {
    list.split_at(end);
    list.split_at(start);
    let mut freed = 0;
    for key in list.intersecting_keys(start, end) {
        let contained = {
            let vma = list.get(key).expect("intersecting key vanished");
            vma.start() >= start && vma.end() <= end
        };
        if contained {
            let vma = list.remove(key).expect("intersecting key vanished");
            freed += evacuate_vma(sbm, vma);
        }
    }
    freed
}

/// Whether `[start, end)` is fully covered by VMAs of this worker.
fn ismapped_locked(list: &VmaList, start: usize, end: usize) -> bool {
    let mut cur = start;
    for key in list.intersecting_keys(start, end) {
        let vma = list.get(key).expect("intersecting key vanished");
        if vma.start() > cur {
            return false;
        }
        cur = vma.end();
        if cur >= end {
            return true;
        }
    }
    false
}

/// Rewrite protection over `[start, end)`. Caller holds the write lock
/// and has verified the range is mapped.
fn protect_locked(list: &mut VmaList, start: usize, end: usize, perm: Perm) -> Result<(), VmError> {
    list.split_at(end);
    list.split_at(start);
    for key in list.intersecting_keys(start, end) {
        let vma = list.get_mut(key).expect("intersecting key vanished");
        if vma.perm() == perm {
            continue;
        }
        vma.validate_perm(perm)?;
        if vma.start() >= start && vma.end() <= end {
            vma.protect(perm);
            let mut op = ProtectOp::new(perm);
            operate_range(&mut op, crate::root(), vma.start(), vma.start(), vma.size())?;
        }
    }
    Ok(())
}

/// msync over `[start, end)`, clamped per VMA.
fn sync_locked(list: &VmaList, start: usize, end: usize) -> Result<(), VmError> {
    let mut result = Err(VmError::NotMapped);
    for key in list.intersecting_keys(start, end) {
        let vma = list.get(key).expect("intersecting key vanished");
        result = vma.sync(
            core::cmp::max(start, vma.start()),
            core::cmp::min(end, vma.end()),
        );
        if result.is_err() {
            break;
        }
    }
    result
}

/// Reserve or carve a virtual range and insert the VMA(s) for it.
///
/// With `search` the current CPU's worker supplies any free range of the
/// right size. Without it the exact range is taken: still-unclaimed
/// superblocks are claimed first, whatever is mapped there is evacuated,
/// and the request is carved into one VMA per worker territory segment.
fn allocate(vma: Vma, start: usize, size: usize, search: bool) -> Result<usize, VmError> {
    let sbm = crate::sb_mgr();

    if search {
        let start = sbm.reserve_range(size)?;
        let mut vma = vma;
        vma.set(start, start + size);
        ensure_next_two_stack_pages();
        {
            let mut list = sbm.vma_lock(start).write();
            sbm.insert_locked(&mut list, vma);
        }
        fault::forget_sigsegv_range(start, start + size);
        return Ok(start);
    }

    let end = start + size;
    // Give every superblock in the fixed range an owner before routing.
    let mut sb = page_align_down(start);
    while sb < end {
        if crate::layout::in_superblock_area(sb) && sbm.owner(sb) == crate::layout::SUPERBLOCK_FREE
        {
            sbm.claim_superblock_at(sb)?;
        }
        sb = crate::layout::superblock_boundary_after(sb).min(end);
    }

    ensure_next_two_stack_pages();
    for (seg_start, seg_size, owner) in sbm.generate_owner_list(start, size) {
        let worker = sbm.worker_by_index(owner as usize);
        let mut list = worker.vma_list.write();
        evacuate_locked(sbm, &mut list, seg_start, seg_start + seg_size);
        worker.free_ranges.write().allocate(seg_start, seg_size);
        sbm.insert_locked(
            &mut list,
            vma.carve(AddrRange::new(seg_start, seg_start + seg_size)),
        );
    }
    fault::forget_sigsegv_range(start, end);
    Ok(start)
}

/// Eagerly populate `[start, start + len)` under the owning workers'
/// write locks (the MAP_POPULATE path).
fn populate_range(start: usize, len: usize, write: bool) -> Result<(), VmError> {
    let sbm = crate::sb_mgr();
    ensure_next_two_stack_pages();
    for (seg_start, seg_size, owner) in sbm.generate_owner_list(start, len) {
        let worker = sbm.worker_by_index(owner as usize);
        let list = worker.vma_list.write();
        let seg_end = seg_start + seg_size;
        for key in list.intersecting_keys(seg_start, seg_end) {
            let vma = list.get(key).expect("intersecting key vanished");
            let s = core::cmp::max(seg_start, vma.start());
            let e = core::cmp::min(seg_end, vma.end());
            populate_vma(vma, s, e - s, write)?;
        }
    }
    Ok(())
}

/// Evacuate `[start, end)` across workers (cleanup after a failed
/// eager populate).
fn evacuate_range(start: usize, end: usize) {
    let sbm = crate::sb_mgr();
    ensure_next_two_stack_pages();
    for (seg_start, seg_size, owner) in sbm.generate_owner_list(start, end - start) {
        let worker = sbm.worker_by_index(owner as usize);
        let mut list = worker.vma_list.write();
        evacuate_locked(sbm, &mut list, seg_start, seg_start + seg_size);
    }
}

// ============================================================================
// mmap family
// ============================================================================

/// Map anonymous memory. Returns the mapped address.
pub fn map_anon(addr: usize, size: usize, flags: MmapFlags, perm: Perm) -> Result<usize, VmError> {
    if size == 0 {
        return Err(VmError::InvalidArgument);
    }
    let search = !flags.contains(MmapFlags::FIXED);
    if !search && !is_page_aligned(addr) {
        return Err(VmError::InvalidArgument);
    }
    let size = page_align_up(size);

    let vma = Vma::anon(AddrRange::new(addr, addr + size), perm, flags);
    let v = allocate(vma, addr, size, search)?;

    if flags.contains(MmapFlags::POPULATE) {
        if let Err(e) = populate_range(v, size, false) {
            evacuate_range(v, v + size);
            return Err(e);
        }
    }
    log::trace!("[MMAP] anon {v:#x}+{size:#x} perm={perm:?} flags={flags:?}");
    Ok(v)
}

/// Map `size` bytes of `file` starting at byte `offset`.
pub fn map_file(
    addr: usize,
    size: usize,
    flags: MmapFlags,
    perm: Perm,
    file: Arc<dyn VmFile>,
    offset: u64,
) -> Result<usize, VmError> {
    if size == 0 {
        return Err(VmError::InvalidArgument);
    }
    let search = !flags.contains(MmapFlags::FIXED);
    if !search && !is_page_aligned(addr) {
        return Err(VmError::InvalidArgument);
    }
    let size = page_align_up(size);

    let fsize = file.stat()?.size;
    let vma = Vma::file(
        AddrRange::new(addr, addr + size),
        perm,
        flags,
        Arc::clone(&file),
        offset,
    )?;
    let v = allocate(vma, addr, size, search)?;

    if flags.contains(MmapFlags::POPULATE) {
        // Nothing past EOF can be populated eagerly.
        let limit = core::cmp::min(size, page_align_up(fsize as usize));
        if limit > 0 {
            if let Err(e) = populate_range(v, limit, false) {
                evacuate_range(v, v + size);
                return Err(e);
            }
        }
    }
    log::trace!("[MMAP] file {v:#x}+{size:#x} off={offset:#x} perm={perm:?}");
    Ok(v)
}

/// Unmap `[addr, addr + length)`. The range must be fully mapped.
pub fn munmap(addr: usize, length: usize) -> Result<(), VmError> {
    if length == 0 || !is_page_aligned(addr) {
        return Err(VmError::InvalidArgument);
    }
    let length = page_align_up(length);
    let sbm = crate::sb_mgr();

    ensure_next_two_stack_pages();
    let mut list = sbm.vma_lock(addr).write();
    if !ismapped_locked(&list, addr, addr + length) {
        return Err(VmError::InvalidArgument);
    }
    // Flush shared file pages before they disappear; an unsyncable
    // mapping (private, anonymous) is not an unmap error.
    let _ = sync_locked(&list, addr, addr + length);
    evacuate_locked(sbm, &mut list, addr, addr + length);
    log::trace!("[MUNMAP] {addr:#x}+{length:#x}");
    Ok(())
}

/// Unmap the entire VMA containing `addr`.
pub fn munmap_anon(addr: usize) -> Result<(), VmError> {
    let sbm = crate::sb_mgr();
    ensure_next_two_stack_pages();
    let mut list = sbm.vma_lock(addr).write();
    let Some(vma) = list.find_intersecting(addr) else {
        return Err(VmError::InvalidArgument);
    };
    let key = vma.start();
    let vma = list.remove(key).expect("intersecting VMA vanished");
    evacuate_vma(sbm, vma);
    Ok(())
}

/// Change protection of `[addr, addr + len)`, splitting VMAs at the
/// boundaries. Partially populated ranges update page tables for the
/// populated pages and just the VMAs elsewhere.
pub fn mprotect(addr: usize, len: usize, perm: Perm) -> Result<(), VmError> {
    if len == 0 || !is_page_aligned(addr) {
        return Err(VmError::InvalidArgument);
    }
    let len = page_align_up(len);
    let sbm = crate::sb_mgr();

    ensure_next_two_stack_pages();
    let mut list = sbm.vma_lock(addr).write();
    if !ismapped_locked(&list, addr, addr + len) {
        return Err(VmError::NotMapped);
    }
    protect_locked(&mut list, addr, addr + len, perm)
}

/// Write dirty shared file pages in `[addr, addr + length)` back to their
/// files. `flags` is accepted for interface parity and ignored.
pub fn msync(addr: usize, length: usize, _flags: i32) -> Result<(), VmError> {
    let length = page_align_up(length);
    let sbm = crate::sb_mgr();
    let list = sbm.vma_lock(addr).read();
    if !ismapped_locked(&list, addr, addr + length) {
        return Err(VmError::NotMapped);
    }
    sync_locked(&list, addr, addr + length)
}

/// Apply `advice` to `[addr, addr + size)`. The range must be mapped.
pub fn madvise(addr: usize, size: usize, advice: Advice) -> Result<(), VmError> {
    let size = page_align_up(size);
    let sbm = crate::sb_mgr();

    ensure_next_two_stack_pages();
    let mut list = sbm.vma_lock(addr).write();
    if !ismapped_locked(&list, addr, addr + size) {
        return Err(VmError::NotMapped);
    }
    match advice {
        Advice::DontNeed => {
            let end = addr + size;
            for key in list.intersecting_keys(addr, end) {
                let vma = list.get(key).expect("intersecting key vanished");
                let s = core::cmp::max(addr, vma.start());
                let e = core::cmp::min(end, vma.end());
                let mut op = UnpopulateOp::new(vma.page_ops());
                operate_range(&mut op, crate::root(), vma.start(), s, e - s)?;
            }
            Ok(())
        }
        Advice::NoHugePage => {
            let end = addr + size;
            for key in list.intersecting_keys(addr, end) {
                let vma = list.get_mut(key).expect("intersecting key vanished");
                if vma.has_flags(MmapFlags::SMALL) {
                    continue;
                }
                vma.update_flags(MmapFlags::SMALL);
                let (s, e) = (
                    core::cmp::max(addr, vma.start()),
                    core::cmp::min(end, vma.end()),
                );
                let vma_start = vma.start();
                let mut op = SplitHugeOp;
                operate_range(&mut op, crate::root(), vma_start, s, e - s)?;
            }
            Ok(())
        }
    }
}

/// Fill `vec` with residency bytes (bit 0 set = resident) for each page
/// of `[addr, addr + length)`.
pub fn mincore(addr: usize, length: usize, vec: &mut [u8]) -> Result<(), VmError> {
    let start = page_align_down(addr);
    let end = page_align_up(addr + length);
    let npages = (end - start) / PAGE_SIZE;
    if vec.len() < npages {
        return Err(VmError::InvalidArgument);
    }

    let sbm = crate::sb_mgr();
    let list = sbm.vma_lock(addr).read();
    if !linear::is_linear_mapped(addr, length) && !ismapped_locked(&list, start, end) {
        return Err(VmError::NotMapped);
    }
    for (i, page) in (start..end).step_by(PAGE_SIZE).enumerate() {
        vec[i] = u8::from(virt_to_phys_pt(crate::root(), page).is_some());
    }
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

/// Whether `[addr, addr + size)` is entirely covered by mappings.
pub fn ismapped(addr: usize, size: usize) -> bool {
    let sbm = crate::sb_mgr();
    let list = sbm.vma_lock(addr).read();
    ismapped_locked(&list, addr, addr + size)
}

/// Whether every page of `[addr, addr + size)` is resident and readable.
pub fn isreadable(addr: usize, size: usize) -> bool {
    let start = page_align_down(addr);
    let end = page_align_up(addr + size);
    let root = crate::root();
    (start..end)
        .step_by(PAGE_SIZE)
        .all(|page| virt_to_phys_pt(root, page).is_some())
}

/// Translate a virtual address through the page tables.
pub fn virt_to_phys(addr: usize) -> Option<usize> {
    virt_to_phys_pt(crate::root(), addr)
}

/// Sum of all VMA sizes.
pub fn all_vmas_size() -> usize {
    crate::sb_mgr().all_vmas_size()
}

/// All mappings in `/proc/self/maps` format.
pub fn procfs_maps() -> alloc::string::String {
    crate::sb_mgr().procfs_maps()
}

// ============================================================================
// Kernel-range helpers
// ============================================================================

/// Populate a kernel range outside any VMA with zeroed anonymous pages.
pub fn vpopulate(addr: usize, size: usize) -> Result<(), VmError> {
    debug_assert!(!crate::layout::in_vma_range(addr));
    let _guard = PAGE_TABLE_HIGH_MUTEX.lock();
    let provider = ZeroedAnonymous;
    let mut op = PopulateOp::new(&provider, Perm::rwx(), false, true);
    operate_range(&mut op, crate::root(), addr, addr, size)?;
    Ok(())
}

/// Undo `vpopulate`.
pub fn vdepopulate(addr: usize, size: usize) -> Result<(), VmError> {
    debug_assert!(!crate::layout::in_vma_range(addr));
    let _guard = PAGE_TABLE_HIGH_MUTEX.lock();
    let provider = ZeroedAnonymous;
    let mut op = UnpopulateOp::new(&provider);
    operate_range(&mut op, crate::root(), addr, addr, size)?;
    Ok(())
}

/// Reclaim intermediate tables emptied by `vdepopulate`.
pub fn vcleanup(addr: usize, size: usize) -> Result<(), VmError> {
    debug_assert!(!crate::layout::in_vma_range(addr));
    let _guard = PAGE_TABLE_HIGH_MUTEX.lock();
    let mut op = CleanupIntermediateOp::new();
    operate_range(&mut op, crate::root(), addr, addr, size)?;
    Ok(())
}
