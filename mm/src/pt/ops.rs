//! Concrete page-table operations.
//!
//! Each type here encodes one algorithm over a range; the walker drives it
//! per the capability constants on its `PageOp` impl.

use alloc::vec::Vec;

use aos_hal::mem::PAGE_SIZE;
use aos_hal::mmu::{
    level_size, make_empty_pte, phys_to_virt, pte_level_mask, Mattr, PtElement, Ptep,
    NR_PAGE_SIZES,
};
use aos_hal::traits::{page_allocator, rcu_defer, rcu_read_lock};

use super::walker::{map_range, PageOp, PageTableRoot};
use crate::file::VmFile;
use crate::provider::PageProvider;
use crate::vma::Perm;
use crate::VmError;

fn make_vma_leaf_pte(level: usize, perm: Perm, mattr: Mattr) -> PtElement {
    let mut pte = aos_hal::mmu::make_leaf_pte(
        level,
        0,
        perm.contains(Perm::WRITE),
        perm.contains(Perm::EXEC),
        mattr,
    );
    // PROT_NONE still installs a present entry; the reserved bit makes any
    // access fault.
    pte.set_no_access(perm.is_empty());
    pte
}

/// RCU callback: return an intermediate table page to the allocator.
fn free_intermediate_page(pa: usize) {
    page_allocator().free_page(pa);
}

// ============================================================================
// TLB gather
// ============================================================================

/// Batches freed pages so one TLB flush covers many unmaps. Pages are only
/// returned to the allocator after the flush: until then another CPU may
/// still hold a stale translation to them.
pub struct TlbGather {
    pages: [(usize, usize); Self::MAX_PAGES],
    nr: usize,
}

impl TlbGather {
    const MAX_PAGES: usize = 20;

    pub const fn new() -> Self {
        Self {
            pages: [(0, 0); Self::MAX_PAGES],
            nr: 0,
        }
    }

    /// Queue `(pa, size)`; flushes first when full. Returns whether this
    /// call flushed.
    pub fn push(&mut self, pa: usize, size: usize) -> bool {
        let mut flushed = false;
        if self.nr == Self::MAX_PAGES {
            self.flush();
            flushed = true;
        }
        self.pages[self.nr] = (pa, size);
        self.nr += 1;
        flushed
    }

    /// Flush the TLB once and free everything queued. Returns whether
    /// there was anything to do.
    pub fn flush(&mut self) -> bool {
        if self.nr == 0 {
            return false;
        }
        aos_hal::mmu::flush_tlb_all();
        for &(pa, size) in &self.pages[..self.nr] {
            if size == PAGE_SIZE {
                page_allocator().free_page(pa);
            } else {
                page_allocator().free_huge_page(pa, size);
            }
        }
        self.nr = 0;
        true
    }
}

// ============================================================================
// populate
// ============================================================================

/// Fill the page table over a range, asking the provider for backing.
///
/// Present entries that are already write-compatible are kept (concurrent
/// faults, re-populates). A failed huge-page allocation makes `page()`
/// return false, which sends the walker down to 4 KiB entries.
pub struct PopulateOp<'a> {
    provider: &'a dyn PageProvider,
    perm: Perm,
    write: bool,
    map_dirty: bool,
    small_only: bool,
    accounted: usize,
    oom: bool,
}

impl<'a> PopulateOp<'a> {
    pub fn new(provider: &'a dyn PageProvider, perm: Perm, write: bool, map_dirty: bool) -> Self {
        Self {
            provider,
            perm,
            write,
            map_dirty,
            small_only: false,
            accounted: 0,
            oom: false,
        }
    }

    /// Restrict the walk to 4 KiB entries (`populate_small`): used for
    /// mappings flagged SMALL, where huge pages are never wanted.
    pub fn small(provider: &'a dyn PageProvider, perm: Perm, write: bool, map_dirty: bool) -> Self {
        Self {
            small_only: true,
            ..Self::new(provider, perm, write, map_dirty)
        }
    }

    fn skip(&self, pte: PtElement) -> bool {
        if pte.is_empty() {
            return false;
        }
        // Present already; only a write fault against a read-only entry
        // needs provider attention.
        !self.write || pte.writable()
    }

    /// Did a 4 KiB allocation fail during the walk?
    #[must_use]
    pub fn hard_oom(&self) -> bool {
        self.oom
    }
}

impl PageOp for PopulateOp<'_> {
    const ALLOCATES_INTERMEDIATE: bool = true;
    const SKIPS_EMPTY: bool = false;

    fn nr_page_sizes(&self) -> usize {
        if self.small_only {
            1
        } else {
            NR_PAGE_SIZES
        }
    }

    fn page(&mut self, ptep: Ptep, level: usize, offset: usize) -> bool {
        let pte = ptep.read();
        if self.skip(pte) {
            return true;
        }

        let mut pte = make_vma_leaf_pte(level, self.perm, Mattr::Normal);
        pte.set_dirty(self.map_dirty || self.write);

        match self.provider.map(offset as u64, ptep, level, pte, self.write) {
            Ok(installed) => {
                if installed {
                    self.accounted += level_size(level);
                }
                true
            }
            Err(_) => {
                // Huge-page failure falls back to small pages via the
                // walker; a small-page failure is real memory exhaustion.
                if level == 0 {
                    self.oom = true;
                }
                false
            }
        }
    }

    fn account_results(&self) -> usize {
        self.accounted
    }
}

// ============================================================================
// unpopulate
// ============================================================================

/// Undo `populate`: retract every present entry, batching freed pages in a
/// TLB gather, and reclaim emptied intermediate tables through RCU.
pub struct UnpopulateOp<'a> {
    provider: &'a dyn PageProvider,
    gather: TlbGather,
    do_flush: bool,
    accounted: usize,
}

impl<'a> UnpopulateOp<'a> {
    pub fn new(provider: &'a dyn PageProvider) -> Self {
        Self {
            provider,
            gather: TlbGather::new(),
            do_flush: false,
            accounted: 0,
        }
    }
}

impl PageOp for UnpopulateOp<'_> {
    const ALLOCATES_INTERMEDIATE: bool = false;

    fn page(&mut self, ptep: Ptep, level: usize, offset: usize) -> bool {
        let pte = ptep.read();
        let size = level_size(level);
        // The entry is retracted even if it is "not present": evacuate
        // only runs over allocated ranges, and not-present may just mean
        // mprotect(PROT_NONE).
        if self
            .provider
            .unmap(phys_to_virt(pte.addr()), offset as u64, ptep, level)
        {
            self.do_flush = !self.gather.push(pte.addr(), size);
        } else {
            // Provider kept the page (file cache); still need the flush.
            self.do_flush = true;
        }
        self.accounted += size;
        true
    }

    fn intermediate_page_post(&mut self, ptep: Ptep, _offset: usize) {
        // The whole 2 MiB below this entry was just unmapped; the table is
        // empty. Walkers on other CPUs may still hold a pointer to it, so
        // the free rides out a grace period.
        let pte = ptep.read();
        ptep.write(make_empty_pte());
        rcu_defer(free_intermediate_page, pte.addr());
    }

    fn tlb_flush_needed(&mut self) -> bool {
        // If the gather flushed, the freed pages are gone and no second
        // flush is needed unless a kept-page retraction asked for one.
        !self.gather.flush() && self.do_flush
    }

    fn account_results(&self) -> usize {
        self.accounted
    }
}

// ============================================================================
// protect
// ============================================================================

/// Rewrite one present entry's permissions. Returns whether a permission
/// was removed, which is what requires a TLB flush on x86.
fn change_perm(ptep: Ptep, mut perm: Perm) -> bool {
    let mut pte = ptep.read();
    let mut old = Perm::empty();
    if pte.valid() {
        old |= Perm::READ;
    }
    if pte.writable() {
        old |= Perm::WRITE;
    }
    if pte.executable() {
        old |= Perm::EXEC;
    }

    // A COW page stays read-only regardless of the requested protection.
    if pte.cow() {
        perm.remove(Perm::WRITE);
    }

    // With the present bit off, write and exec are implicitly off too, so
    // any granted permission implies read; PROT_NONE is encoded with the
    // reserved bit instead.
    pte.set_valid(true);
    pte.set_writable(perm.contains(Perm::WRITE));
    pte.set_executable(perm.contains(Perm::EXEC));
    pte.set_no_access(perm.is_empty());
    ptep.write(pte);

    !old.difference(perm).is_empty()
}

/// Apply new permissions to every present entry in a range.
pub struct ProtectOp {
    perm: Perm,
    do_flush: bool,
}

impl ProtectOp {
    pub fn new(perm: Perm) -> Self {
        Self {
            perm,
            do_flush: false,
        }
    }
}

impl PageOp for ProtectOp {
    const ALLOCATES_INTERMEDIATE: bool = false;

    fn page(&mut self, ptep: Ptep, _level: usize, _offset: usize) -> bool {
        self.do_flush |= change_perm(ptep, self.perm);
        true
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }
}

// ============================================================================
// dirty cleaning (msync)
// ============================================================================

/// Consumer of dirty ranges discovered by `DirtyCleanerOp`.
pub trait DirtyHandler {
    fn dirty(&mut self, pa: usize, offset: usize, size: usize);
    fn finalize(&mut self) -> Result<(), VmError> {
        Ok(())
    }
}

/// Clear the dirty bit over a range, handing each dirty page to a handler.
pub struct DirtyCleanerOp<H: DirtyHandler> {
    handler: H,
    do_flush: bool,
    accounted: usize,
}

impl<H: DirtyHandler> DirtyCleanerOp<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            do_flush: false,
            accounted: 0,
        }
    }
}

impl<H: DirtyHandler> PageOp for DirtyCleanerOp<H> {
    const ALLOCATES_INTERMEDIATE: bool = false;

    fn page(&mut self, ptep: Ptep, level: usize, offset: usize) -> bool {
        let mut pte = ptep.read();
        if !pte.dirty() {
            return true;
        }
        self.do_flush = true;
        pte.set_dirty(false);
        ptep.write(pte);
        let size = level_size(level);
        self.handler.dirty(ptep.read().addr(), offset, size);
        self.accounted += size;
        true
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        self.handler.finalize()
    }

    fn account_results(&self) -> usize {
        self.accounted
    }
}

/// msync write-back: queue dirty file ranges during the walk, write them
/// out in `finalize` (after the TLB flush, so no store is lost).
pub struct DirtyPageSync<'a> {
    file: &'a dyn VmFile,
    foffset: u64,
    fsize: u64,
    queue: Vec<(usize, u64, usize)>,
}

impl<'a> DirtyPageSync<'a> {
    pub fn new(file: &'a dyn VmFile, foffset: u64, fsize: u64) -> Self {
        Self {
            file,
            foffset,
            fsize,
            queue: Vec::new(),
        }
    }
}

impl DirtyHandler for DirtyPageSync<'_> {
    fn dirty(&mut self, pa: usize, offset: usize, size: usize) {
        let off = self.foffset + offset as u64;
        if off >= self.fsize {
            return;
        }
        let len = core::cmp::min(size as u64, self.fsize - off) as usize;
        self.queue.push((pa, off, len));
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        while let Some((pa, off, len)) = self.queue.pop() {
            // SAFETY: the page was mapped when queued and the VMA lock
            // pins the mapping for the duration of the sync.
            let buf = unsafe { core::slice::from_raw_parts(phys_to_virt(pa) as *const u8, len) };
            let written = self.file.write_at(buf, off)?;
            if written != len {
                return Err(VmError::IoError);
            }
        }
        Ok(())
    }
}

// ============================================================================
// probes
// ============================================================================

/// Read a single translation and compose the physical address.
struct VirtToPhysOp {
    virt: usize,
    result: Option<usize>,
}

impl PageOp for VirtToPhysOp {
    const ALLOCATES_INTERMEDIATE: bool = false;
    const ONCE: bool = true;
    const SPLITS_LARGE: bool = false;

    fn page(&mut self, ptep: Ptep, level: usize, _offset: usize) -> bool {
        debug_assert!(self.result.is_none());
        let pte = ptep.read();
        self.result = Some(pte.addr() | (self.virt & !pte_level_mask(level)));
        true
    }

    fn sub_page(&mut self, ptep: Ptep, level: usize, offset: usize) {
        debug_assert!(ptep.read().large());
        self.page(ptep, level, offset);
    }
}

/// Translate `virt` through the page table; `None` when not mapped.
pub fn virt_to_phys_pt(root: &PageTableRoot, virt: usize) -> Option<usize> {
    let vbase = aos_hal::mem::page_align_down(virt);
    let mut op = VirtToPhysOp { virt, result: None };
    map_range(&mut op, root, vbase, vbase, PAGE_SIZE, PAGE_SIZE).ok()?;
    op.result
}

/// Visitor for a single PTE, read lock-free under RCU.
pub trait PteVisitor {
    fn pte(&mut self, pte: PtElement, level: usize);
}

struct PteVisitOp<'a> {
    visitor: &'a mut dyn PteVisitor,
}

impl PageOp for PteVisitOp<'_> {
    const ALLOCATES_INTERMEDIATE: bool = false;
    const ONCE: bool = true;
    const SPLITS_LARGE: bool = false;

    fn ptep_read(&self, ptep: Ptep) -> PtElement {
        ptep.ll_read()
    }

    fn page(&mut self, ptep: Ptep, level: usize, _offset: usize) -> bool {
        let pte = self.ptep_read(ptep);
        debug_assert_eq!(pte.large(), level > 0);
        self.visitor.pte(pte, level);
        true
    }

    fn sub_page(&mut self, ptep: Ptep, level: usize, offset: usize) {
        self.page(ptep, level, offset);
    }
}

/// Visit the PTE mapping `virt` under the RCU read lock, without taking
/// any VMA lock. The fault-free path for page-cache lookups.
pub fn virt_visit_pte_rcu(root: &PageTableRoot, virt: usize, visitor: &mut dyn PteVisitor) {
    let vbase = aos_hal::mem::page_align_down(virt);
    let mut op = PteVisitOp { visitor };
    let _rcu = rcu_read_lock();
    let _ = map_range(&mut op, root, vbase, vbase, PAGE_SIZE, PAGE_SIZE);
}

// ============================================================================
// intermediate cleanup
// ============================================================================

/// Count live leaf entries under each level-1 table; drop tables that turn
/// out empty. Used after unpopulate of kernel ranges, where the walker
/// cannot know which tables emptied.
pub struct CleanupIntermediateOp {
    live_ptes: usize,
    do_flush: bool,
}

impl CleanupIntermediateOp {
    pub fn new() -> Self {
        Self {
            live_ptes: 0,
            do_flush: false,
        }
    }
}

impl Default for CleanupIntermediateOp {
    fn default() -> Self {
        Self::new()
    }
}

impl PageOp for CleanupIntermediateOp {
    const ALLOCATES_INTERMEDIATE: bool = false;
    const SPLITS_LARGE: bool = false;

    fn page(&mut self, _ptep: Ptep, level: usize, _offset: usize) -> bool {
        if level == 0 {
            self.live_ptes += 1;
        }
        true
    }

    fn intermediate_page_pre(&mut self, _ptep: Ptep, _offset: usize) {
        self.live_ptes = 0;
    }

    fn intermediate_page_post(&mut self, ptep: Ptep, _offset: usize) {
        if self.live_ptes != 0 {
            return;
        }
        let old = ptep.read();
        #[cfg(debug_assertions)]
        {
            // SAFETY: the table is still live; reclaim happens below.
            let table = unsafe { aos_hal::mmu::PageTable::from_pa(old.addr()) };
            debug_assert!(table.is_empty());
        }
        ptep.write(make_empty_pte());
        rcu_defer(free_intermediate_page, old.addr());
        self.do_flush = true;
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }
}

// ============================================================================
// split huge pages
// ============================================================================

/// Force existing 2 MiB mappings in a range down to 4 KiB mappings
/// (madvise NOHUGEPAGE). The splitting itself happens in the walker; the
/// leaf callback has nothing left to do.
pub struct SplitHugeOp;

impl PageOp for SplitHugeOp {
    const ALLOCATES_INTERMEDIATE: bool = false;

    fn nr_page_sizes(&self) -> usize {
        1
    }

    fn page(&mut self, _ptep: Ptep, level: usize, _offset: usize) -> bool {
        debug_assert_eq!(level, 0);
        true
    }
}

// ============================================================================
// linear map
// ============================================================================

/// Eagerly write leaf entries for a 1:1 kernel range at the given physical
/// base. Overwrites whatever was there; kernel ranges are not faulted.
pub struct LinearPageMapperOp {
    start: usize,
    end: usize,
    mattr: Mattr,
}

impl LinearPageMapperOp {
    pub fn new(start: usize, size: usize, mattr: Mattr) -> Self {
        Self {
            start,
            end: start + size,
            mattr,
        }
    }
}

impl PageOp for LinearPageMapperOp {
    const ALLOCATES_INTERMEDIATE: bool = true;
    const SKIPS_EMPTY: bool = false;
    const DESCENDS: bool = false;

    fn page(&mut self, ptep: Ptep, level: usize, offset: usize) -> bool {
        let pa = self.start.wrapping_add(offset);
        debug_assert!(pa < self.end);
        ptep.write(aos_hal::mmu::make_leaf_pte(level, pa, true, true, self.mattr));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::walker::operate_range;
    use crate::provider::{PageProvider, ZeroedAnonymous};
    use crate::testutil;
    use aos_hal::mem::{HUGE_PAGE_SIZE, PAGE_SIZE};
    use aos_hal::mmu::{make_empty_pte, Ptep};

    // A 2 MiB-aligned user address; the roots below are test-local, so the
    // walks never touch shared state.
    const TVA: usize = 0x2000_0000_0000;

    fn root() -> PageTableRoot {
        testutil::frames();
        PageTableRoot::new().unwrap()
    }

    fn probe(root: &PageTableRoot, va: usize) -> Option<usize> {
        virt_to_phys_pt(root, va)
    }

    #[test]
    fn test_populate_small_pages() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        let n = operate_range(&mut op, &root, TVA, TVA, 2 * PAGE_SIZE).unwrap();
        assert_eq!(n, 2 * PAGE_SIZE);

        for off in [0, PAGE_SIZE] {
            let pa = probe(&root, TVA + off).expect("page mapped");
            // Zero-filled backing.
            let b = unsafe { (phys_to_virt(pa) as *const u8).read() };
            assert_eq!(b, 0);
        }
        assert!(probe(&root, TVA + 2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_populate_sets_perm_and_dirty() {
        struct Check {
            seen: Option<(bool, bool, bool)>,
        }
        impl PteVisitor for Check {
            fn pte(&mut self, pte: PtElement, _level: usize) {
                self.seen = Some((pte.writable(), pte.executable(), pte.dirty()));
            }
        }

        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        let mut check = Check { seen: None };
        virt_visit_pte_rcu(&root, TVA, &mut check);
        let (w, x, d) = check.seen.unwrap();
        assert!(w);
        assert!(!x);
        assert!(d); // map_dirty: anonymous memory is born dirty
    }

    #[test]
    fn test_populate_huge_page() {
        struct Level {
            level: Option<usize>,
        }
        impl PteVisitor for Level {
            fn pte(&mut self, pte: PtElement, level: usize) {
                assert!(pte.large() == (level > 0));
                self.level = Some(level);
            }
        }

        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::new(&prov, Perm::rw(), false, true);
        let n = operate_range(&mut op, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        assert_eq!(n, HUGE_PAGE_SIZE);

        let mut lv = Level { level: None };
        virt_visit_pte_rcu(&root, TVA + 0x1000, &mut lv);
        assert_eq!(lv.level, Some(1));
    }

    #[test]
    fn test_populate_huge_falls_back_to_small() {
        // A provider whose huge allocations always fail.
        struct NoHuge(ZeroedAnonymous);
        impl PageProvider for NoHuge {
            fn map(
                &self,
                offset: u64,
                ptep: Ptep,
                level: usize,
                pte: PtElement,
                write: bool,
            ) -> Result<bool, VmError> {
                if level > 0 {
                    return Err(VmError::OutOfMemory);
                }
                self.0.map(offset, ptep, level, pte, write)
            }
            fn unmap(&self, virt: usize, offset: u64, ptep: Ptep, level: usize) -> bool {
                self.0.unmap(virt, offset, ptep, level)
            }
        }

        let root = root();
        let prov = NoHuge(ZeroedAnonymous);
        let mut op = PopulateOp::new(&prov, Perm::rw(), false, true);
        let n = operate_range(&mut op, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        assert_eq!(n, HUGE_PAGE_SIZE);
        assert!(!op.hard_oom());

        struct Level {
            level: Option<usize>,
        }
        impl PteVisitor for Level {
            fn pte(&mut self, pte: PtElement, level: usize) {
                assert!(pte.large() == (level > 0));
                self.level = Some(level);
            }
        }
        let mut lv = Level { level: None };
        virt_visit_pte_rcu(&root, TVA, &mut lv);
        assert_eq!(lv.level, Some(0));
    }

    #[test]
    fn test_populate_is_idempotent() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        assert_eq!(
            operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap(),
            PAGE_SIZE
        );
        let mut again = PopulateOp::small(&prov, Perm::rw(), false, true);
        assert_eq!(operate_range(&mut again, &root, TVA, TVA, PAGE_SIZE).unwrap(), 0);
    }

    #[test]
    fn test_unpopulate_clears_entries() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, 4 * PAGE_SIZE).unwrap();

        let mut un = UnpopulateOp::new(&prov);
        let n = operate_range(&mut un, &root, TVA, TVA, 4 * PAGE_SIZE).unwrap();
        assert_eq!(n, 4 * PAGE_SIZE);
        for i in 0..4 {
            assert!(probe(&root, TVA + i * PAGE_SIZE).is_none());
        }
    }

    #[test]
    fn test_populate_unpopulate_huge_roundtrip() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::new(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();

        let mut un = UnpopulateOp::new(&prov);
        let n = operate_range(&mut un, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        assert_eq!(n, HUGE_PAGE_SIZE);
        assert!(probe(&root, TVA).is_none());
    }

    #[test]
    fn test_protect_removes_and_restores_write() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        // Dropping write requires a flush.
        let mut ro = ProtectOp::new(Perm::READ);
        operate_range(&mut ro, &root, TVA, TVA, PAGE_SIZE).unwrap();
        assert!(ro.tlb_flush_needed());

        struct W(Option<bool>);
        impl PteVisitor for W {
            fn pte(&mut self, pte: PtElement, _level: usize) {
                self.0 = Some(pte.writable());
            }
        }
        let mut w = W(None);
        virt_visit_pte_rcu(&root, TVA, &mut w);
        assert_eq!(w.0, Some(false));

        // Granting write back needs no flush on x86.
        let mut rw = ProtectOp::new(Perm::rw());
        operate_range(&mut rw, &root, TVA, TVA, PAGE_SIZE).unwrap();
        assert!(!rw.tlb_flush_needed());
        let mut w = W(None);
        virt_visit_pte_rcu(&root, TVA, &mut w);
        assert_eq!(w.0, Some(true));
    }

    #[test]
    fn test_protect_respects_cow() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::READ, false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        // Mark the page copy-on-write by hand.
        struct Cow;
        impl PageOp for Cow {
            const ALLOCATES_INTERMEDIATE: bool = false;
            fn page(&mut self, ptep: Ptep, _level: usize, _offset: usize) -> bool {
                let mut pte = ptep.read();
                pte.set_cow(true);
                ptep.write(pte);
                true
            }
        }
        operate_range(&mut Cow, &root, TVA, TVA, PAGE_SIZE).unwrap();

        // mprotect(rw) must not make a COW page writable.
        let mut rw = ProtectOp::new(Perm::rw());
        operate_range(&mut rw, &root, TVA, TVA, PAGE_SIZE).unwrap();

        struct W(Option<(bool, bool)>);
        impl PteVisitor for W {
            fn pte(&mut self, pte: PtElement, _level: usize) {
                self.0 = Some((pte.writable(), pte.cow()));
            }
        }
        let mut w = W(None);
        virt_visit_pte_rcu(&root, TVA, &mut w);
        assert_eq!(w.0, Some((false, true)));
    }

    #[test]
    fn test_virt_to_phys_composes_offset() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        let page_pa = probe(&root, TVA).unwrap();
        assert_eq!(probe(&root, TVA + 0x123), Some(page_pa + 0x123));
    }

    #[test]
    fn test_split_huge_preserves_translation() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::new(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        let before = probe(&root, TVA + 0x3000).unwrap();

        let mut split = SplitHugeOp;
        operate_range(&mut split, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();

        struct Level(Option<usize>);
        impl PteVisitor for Level {
            fn pte(&mut self, _pte: PtElement, level: usize) {
                self.0 = Some(level);
            }
        }
        let mut lv = Level(None);
        virt_visit_pte_rcu(&root, TVA + 0x3000, &mut lv);
        assert_eq!(lv.0, Some(0));
        assert_eq!(probe(&root, TVA + 0x3000), Some(before));
    }

    #[test]
    fn test_cleanup_intermediate_drops_empty_table() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        // Partial unpopulate leaves the level-1 table in place.
        let mut un = UnpopulateOp::new(&prov);
        operate_range(&mut un, &root, TVA, TVA, PAGE_SIZE).unwrap();

        let mut clean = CleanupIntermediateOp::new();
        operate_range(&mut clean, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        // The emptied table was dropped, which requires a flush.
        assert!(clean.tlb_flush_needed());

        // Nothing left to clean on a second pass.
        let mut again = CleanupIntermediateOp::new();
        operate_range(&mut again, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        assert!(!again.tlb_flush_needed());
    }

    #[test]
    fn test_cleanup_keeps_live_tables() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, PAGE_SIZE).unwrap();

        let mut clean = CleanupIntermediateOp::new();
        operate_range(&mut clean, &root, TVA, TVA, HUGE_PAGE_SIZE).unwrap();
        assert!(!clean.tlb_flush_needed());
        assert!(probe(&root, TVA).is_some());
    }

    #[test]
    fn test_concurrent_install_single_winner() {
        testutil::frames();
        let mut slot: u64 = 0;
        let ptep = unsafe { Ptep::from_raw(&mut slot) };
        let prov = ZeroedAnonymous;
        let pte = make_vma_leaf_pte(0, Perm::rw(), Mattr::Normal);

        let first = prov.map(0, ptep, 0, pte, false).unwrap();
        let second = prov.map(0, ptep, 0, pte, false).unwrap();
        assert!(first);
        assert!(!second); // the loser freed its candidate page

        let installed = ptep.read();
        assert!(installed.valid());
        // Put the winner's page back.
        assert!(prov.unmap(phys_to_virt(installed.addr()), 0, ptep, 0));
        page_allocator().free_page(installed.addr());
        assert_eq!(ptep.read(), make_empty_pte());
    }

    #[test]
    fn test_tlb_gather_flushes_on_overflow() {
        testutil::frames();
        let mut gather = TlbGather::new();
        let mut pages = alloc::vec::Vec::new();
        for _ in 0..TlbGather::MAX_PAGES {
            pages.push(page_allocator().alloc_page().unwrap());
        }
        let extra = page_allocator().alloc_page().unwrap();

        for &pa in &pages {
            assert!(!gather.push(pa, PAGE_SIZE));
        }
        // The 21st push drains the gather first.
        assert!(gather.push(extra, PAGE_SIZE));
        assert!(gather.flush());
        assert!(!gather.flush());
    }

    #[test]
    fn test_dirty_cleaner_collects_and_clears() {
        let root = root();
        let prov = ZeroedAnonymous;
        let mut op = PopulateOp::small(&prov, Perm::rw(), false, true);
        operate_range(&mut op, &root, TVA, TVA, 2 * PAGE_SIZE).unwrap();

        struct Collect(alloc::vec::Vec<(usize, usize)>);
        impl DirtyHandler for Collect {
            fn dirty(&mut self, _pa: usize, offset: usize, size: usize) {
                self.0.push((offset, size));
            }
        }

        let mut clean = DirtyCleanerOp::new(Collect(alloc::vec::Vec::new()));
        let n = operate_range(&mut clean, &root, TVA, TVA, 2 * PAGE_SIZE).unwrap();
        assert_eq!(n, 2 * PAGE_SIZE);

        // All dirty bits are gone now.
        let mut again = DirtyCleanerOp::new(Collect(alloc::vec::Vec::new()));
        let n = operate_range(&mut again, &root, TVA, TVA, 2 * PAGE_SIZE).unwrap();
        assert_eq!(n, 0);
    }
}
