//! Per-CPU VMA index and superblock allocator.
//!
//! The superblock area is partitioned into fixed-size slices each owned by
//! at most one CPU; a byte cell per superblock records the owner. Every
//! worker carries its own VMA index and free-range map under its own
//! reader/writer locks, so page faults proceed concurrently with unrelated
//! address-space mutations on other CPUs.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use aos_hal::traits::current_cpu_id;
use aos_utils::RwLock;

use crate::layout::{
    in_superblock_area, superblock_addr, superblock_index, KERNEL_WORKER, LOWER_VMA_LIMIT,
    MAIN_MEM_AREA_BASE, MAX_CPUS, NR_WORKERS, SUPERBLOCK_AREA_BASE, SUPERBLOCK_COUNT,
    SUPERBLOCK_FREE, SUPERBLOCK_SIZE, UPPER_VMA_LIMIT,
};
use crate::ranges::FreeRanges;
use crate::vma::{Backing, MmapFlags, Perm, Vma};
use crate::VmError;

// ============================================================================
// VMA list
// ============================================================================

/// One worker's ordered VMA index, keyed by start address and bounded by
/// two zero-sized sentinels at the partition limits.
pub struct VmaList {
    map: BTreeMap<usize, Vma>,
}

impl VmaList {
    fn new() -> Self {
        let mut map = BTreeMap::new();
        // Markers for the edges of the allocatable area; they simplify
        // boundary searches and never match a lookup.
        map.insert(LOWER_VMA_LIMIT, Vma::sentinel(LOWER_VMA_LIMIT));
        map.insert(UPPER_VMA_LIMIT, Vma::sentinel(UPPER_VMA_LIMIT));
        Self { map }
    }

    pub fn insert(&mut self, vma: Vma) {
        let start = vma.start();
        debug_assert!(
            !self.map.contains_key(&start) || self.map[&start].is_sentinel(),
            "overlapping VMA insert"
        );
        self.map.insert(start, vma);
    }

    pub fn remove(&mut self, start: usize) -> Option<Vma> {
        self.map.remove(&start)
    }

    pub fn get(&self, start: usize) -> Option<&Vma> {
        self.map.get(&start)
    }

    pub fn get_mut(&mut self, start: usize) -> Option<&mut Vma> {
        self.map.get_mut(&start)
    }

    /// The single VMA containing `addr`, if any. Logarithmic.
    pub fn find_intersecting(&self, addr: usize) -> Option<&Vma> {
        let (_, vma) = self.map.range(..=addr).next_back()?;
        if vma.range().contains(addr) {
            Some(vma)
        } else {
            None
        }
    }

    /// Start keys of all VMAs intersecting `[start, end)`, in order.
    pub fn intersecting_keys(&self, start: usize, end: usize) -> Vec<usize> {
        let mut keys = Vec::new();
        if end <= start {
            return keys;
        }
        // The previous VMA might spill into our range.
        if let Some((&k, vma)) = self.map.range(..=start).next_back() {
            if vma.end() > start && !vma.is_sentinel() {
                keys.push(k);
            }
        }
        for (&k, vma) in self
            .map
            .range((core::ops::Bound::Excluded(start), core::ops::Bound::Excluded(end)))
        {
            if !vma.is_sentinel() {
                keys.push(k);
            }
        }
        keys
    }

    /// Split the VMA containing `edge` strictly inside its range.
    /// Idempotent at range endpoints.
    pub fn split_at(&mut self, edge: usize) {
        let Some((_, vma)) = self.map.range_mut(..edge).next_back() else {
            return;
        };
        if edge <= vma.start() || edge >= vma.end() {
            return;
        }
        let tail = vma.split_off(edge);
        self.insert(tail);
    }

    /// All non-sentinel VMAs in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values().filter(|v| !v.is_sentinel())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Per-CPU owner of a set of superblocks.
pub struct Worker {
    pub vma_list: RwLock<VmaList>,
    pub free_ranges: RwLock<FreeRanges>,
}

impl Worker {
    fn new() -> Self {
        Self {
            vma_list: RwLock::new(VmaList::new()),
            free_ranges: RwLock::new(FreeRanges::new()),
        }
    }
}

// ============================================================================
// Superblock manager
// ============================================================================

/// The process-wide address-space partition: one worker per CPU plus the
/// kernel worker, and the lock-free superblock ownership cells.
pub struct SuperblockManager {
    workers: Vec<Worker>,
    superblocks: Vec<AtomicU8>,
}

impl SuperblockManager {
    pub fn new() -> Self {
        let mut workers = Vec::with_capacity(NR_WORKERS);
        for _ in 0..NR_WORKERS {
            workers.push(Worker::new());
        }
        let mut superblocks = Vec::with_capacity(SUPERBLOCK_COUNT);
        for _ in 0..SUPERBLOCK_COUNT {
            superblocks.push(AtomicU8::new(SUPERBLOCK_FREE));
        }

        let mgr = Self {
            workers,
            superblocks,
        };
        // The kernel worker owns everything outside the superblock area:
        // the low region below it and the entire upper half (linear map).
        {
            let mut fr = mgr.workers[KERNEL_WORKER].free_ranges.write();
            fr.free(LOWER_VMA_LIMIT, SUPERBLOCK_AREA_BASE - LOWER_VMA_LIMIT);
            fr.free(MAIN_MEM_AREA_BASE, usize::MAX - MAIN_MEM_AREA_BASE);
        }
        mgr
    }

    /// The worker index allocation requests from this CPU go to.
    fn cpu_worker(&self) -> usize {
        core::cmp::min(current_cpu_id(), MAX_CPUS - 1)
    }

    /// Owning worker index for `addr`. Unclaimed superblocks have no
    /// worker; the caller decides whether that is an error or a claim.
    pub fn owner(&self, addr: usize) -> u8 {
        if !in_superblock_area(addr) {
            return KERNEL_WORKER as u8;
        }
        self.superblocks[superblock_index(addr)].load(Ordering::Acquire)
    }

    fn worker(&self, addr: usize) -> &Worker {
        let o = self.owner(addr) as usize;
        if o >= NR_WORKERS {
            // Unclaimed superblock: nothing can be mapped there, so route
            // lookups to the kernel worker, whose index has no user VMAs.
            // A stray fault then resolves to SIGSEGV instead of a crash.
            return &self.workers[KERNEL_WORKER];
        }
        &self.workers[o]
    }

    pub fn worker_by_index(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    /// VMA lock of the worker owning `addr`.
    pub fn vma_lock(&self, addr: usize) -> &RwLock<VmaList> {
        &self.worker(addr).vma_list
    }

    /// Free-range lock of the worker owning `addr`.
    pub fn free_ranges_lock(&self, addr: usize) -> &RwLock<FreeRanges> {
        &self.worker(addr).free_ranges
    }

    // ------------------------------------------------------------------
    // Superblock claiming
    // ------------------------------------------------------------------

    fn release_superblocks(&self, first: usize, n: usize) {
        for cell in &self.superblocks[first..first + n] {
            cell.store(SUPERBLOCK_FREE, Ordering::Release);
        }
    }

    /// Claim `n` consecutive free superblocks for this CPU by CAS. On a
    /// lost race the cells already won are released and the scan restarts.
    pub fn allocate_superblocks(&self, n: usize) -> Result<usize, VmError> {
        debug_assert!(n > 0);
        let me = self.cpu_worker() as u8;
        'retry: loop {
            let mut run = 0usize;
            for i in 0..SUPERBLOCK_COUNT {
                if self.superblocks[i].load(Ordering::Acquire) != SUPERBLOCK_FREE {
                    run = 0;
                    continue;
                }
                run += 1;
                if run < n {
                    continue;
                }
                let first = i + 1 - n;
                for j in first..=i {
                    if self.superblocks[j]
                        .compare_exchange(
                            SUPERBLOCK_FREE,
                            me,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        // Someone else was faster: put back what we won
                        // and start over.
                        self.release_superblocks(first, j - first);
                        continue 'retry;
                    }
                }
                return Ok(first);
            }
            return Err(VmError::OutOfVirtualSpace);
        }
    }

    /// Claim the (free) superblock containing `addr` for this CPU and hand
    /// its whole span to this CPU's free-range map. Used by fixed mappings
    /// landing in territory no CPU has touched yet.
    pub fn claim_superblock_at(&self, addr: usize) -> Result<(), VmError> {
        debug_assert!(in_superblock_area(addr));
        let me = self.cpu_worker() as u8;
        let idx = superblock_index(addr);
        match self.superblocks[idx].compare_exchange(
            SUPERBLOCK_FREE,
            me,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.workers[me as usize]
                    .free_ranges
                    .write()
                    .free(superblock_addr(idx), SUPERBLOCK_SIZE);
                Ok(())
            }
            // Lost to a concurrent claimer; the block has an owner now,
            // which is all the caller needs.
            Err(_) => Ok(()),
        }
    }

    /// Reserve a free virtual range of `size` bytes for this CPU,
    /// claiming fresh superblocks when the free-range map runs dry.
    pub fn reserve_range(&self, size: usize) -> Result<usize, VmError> {
        let me = self.cpu_worker();
        let my = &self.workers[me];

        let mut fr = my.free_ranges.write();
        if let Some(start) = fr.reserve(size) {
            return Ok(start);
        }

        let n = size.div_ceil(SUPERBLOCK_SIZE);
        let first = self.allocate_superblocks(n)?;
        let start = superblock_addr(first);
        let span = n * SUPERBLOCK_SIZE;
        if span > size {
            fr.free(start + size, span - size);
        }
        Ok(start)
    }

    // ------------------------------------------------------------------
    // Range-to-worker routing
    // ------------------------------------------------------------------

    /// Break `[start, start + size)` into `(start, size, owner)` segments,
    /// coalescing consecutive superblocks with the same owner. Loops that
    /// must cross worker territory iterate these segments in order, which
    /// also fixes the cross-worker lock order (ascending addresses).
    pub fn generate_owner_list(&self, start: usize, size: usize) -> Vec<(usize, usize, u8)> {
        let end = start + size;
        // Entirely outside the superblock area: one kernel-worker segment.
        if end <= SUPERBLOCK_AREA_BASE || start >= MAIN_MEM_AREA_BASE {
            return alloc::vec![(start, size, KERNEL_WORKER as u8)];
        }

        let mut res: Vec<(usize, usize, u8)> = Vec::new();
        let mut cur = start;
        while cur < end {
            let (owner, barrier) = if cur < SUPERBLOCK_AREA_BASE {
                (KERNEL_WORKER as u8, SUPERBLOCK_AREA_BASE)
            } else if cur >= MAIN_MEM_AREA_BASE {
                (KERNEL_WORKER as u8, end)
            } else {
                let next = superblock_addr(superblock_index(cur) + 1);
                (self.owner(cur), next)
            };
            let seg_end = core::cmp::min(barrier, end);
            match res.last_mut() {
                Some(prev) if prev.2 == owner && prev.0 + prev.1 == cur => {
                    prev.1 += seg_end - cur;
                }
                _ => res.push((cur, seg_end - cur, owner)),
            }
            cur = seg_end;
        }
        res
    }

    // ------------------------------------------------------------------
    // Index maintenance (callers hold the owning worker's locks)
    // ------------------------------------------------------------------

    /// Insert a VMA into its owning worker's index. Caller holds that
    /// worker's VMA lock for write.
    pub fn insert_locked(&self, list: &mut VmaList, vma: Vma) {
        debug_assert_eq!(
            self.owner(vma.start()),
            self.owner(vma.end().saturating_sub(1).max(vma.start())),
            "VMA straddles worker territory"
        );
        list.insert(vma);
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Sum of all VMA sizes across workers.
    pub fn all_vmas_size(&self) -> usize {
        let mut sum = 0;
        for w in &self.workers {
            let list = w.vma_list.read();
            sum += list.iter().map(Vma::size).sum::<usize>();
        }
        sum
    }

    /// Render every mapping in the `/proc/self/maps` format.
    pub fn procfs_maps(&self) -> String {
        let mut out = String::new();
        for w in &self.workers {
            let list = w.vma_list.read();
            for vma in list.iter() {
                let perm = vma.perm();
                let r = if perm.contains(Perm::READ) { 'r' } else { '-' };
                let wr = if perm.contains(Perm::WRITE) { 'w' } else { '-' };
                let x = if perm.contains(Perm::EXEC) { 'x' } else { '-' };
                out += &format!("{:x}-{:x} {}{}{}p ", vma.start(), vma.end(), r, wr, x);
                if vma.has_flags(MmapFlags::FILE) {
                    if let Backing::File {
                        file,
                        offset,
                        inode,
                        dev,
                        ..
                    } = vma.backing()
                    {
                        let major = (dev >> 8) & 0xfff;
                        let minor = dev & 0xff;
                        out += &format!(
                            "{:08x} {:02x}:{:02x} {} {}\n",
                            offset,
                            major,
                            minor,
                            inode,
                            file.path()
                        );
                        continue;
                    }
                }
                out += "00000000 00:00 0\n";
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vma::AddrRange;

    fn anon(start: usize, end: usize) -> Vma {
        Vma::anon(AddrRange::new(start, end), Perm::rw(), MmapFlags::empty())
    }

    #[test]
    fn test_vma_list_find_intersecting() {
        let mut list = VmaList::new();
        list.insert(anon(0x1000, 0x3000));
        list.insert(anon(0x5000, 0x6000));

        assert!(list.find_intersecting(0x0).is_none());
        assert_eq!(list.find_intersecting(0x1000).unwrap().start(), 0x1000);
        assert_eq!(list.find_intersecting(0x2FFF).unwrap().start(), 0x1000);
        assert!(list.find_intersecting(0x3000).is_none());
        assert!(list.find_intersecting(0x4FFF).is_none());
        assert_eq!(list.find_intersecting(0x5000).unwrap().start(), 0x5000);
    }

    #[test]
    fn test_vma_list_sentinels_never_match() {
        let list = VmaList::new();
        assert!(list.find_intersecting(LOWER_VMA_LIMIT).is_none());
        assert!(list.find_intersecting(UPPER_VMA_LIMIT - 1).is_none());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn test_vma_list_intersecting_keys() {
        let mut list = VmaList::new();
        list.insert(anon(0x1000, 0x3000));
        list.insert(anon(0x3000, 0x4000));
        list.insert(anon(0x8000, 0x9000));

        assert_eq!(list.intersecting_keys(0x2000, 0x8000), [0x1000, 0x3000]);
        assert_eq!(
            list.intersecting_keys(0x0, 0x10000),
            [0x1000, 0x3000, 0x8000]
        );
        assert!(list.intersecting_keys(0x4000, 0x8000).is_empty());
        assert!(list.intersecting_keys(0x5000, 0x5000).is_empty());
    }

    #[test]
    fn test_vma_list_split_at() {
        let mut list = VmaList::new();
        list.insert(anon(0x1000, 0x4000));

        // Splitting at the edges is a no-op.
        list.split_at(0x1000);
        list.split_at(0x4000);
        assert_eq!(list.iter().count(), 1);

        list.split_at(0x2000);
        let starts: Vec<usize> = list.iter().map(Vma::start).collect();
        assert_eq!(starts, [0x1000, 0x2000]);
        assert_eq!(list.get(0x1000).unwrap().end(), 0x2000);
        assert_eq!(list.get(0x2000).unwrap().end(), 0x4000);
    }

    #[test]
    fn test_owner_routing_outside_superblock_area() {
        let mgr = SuperblockManager::new();
        assert_eq!(mgr.owner(0x1000), KERNEL_WORKER as u8);
        assert_eq!(mgr.owner(MAIN_MEM_AREA_BASE), KERNEL_WORKER as u8);
        assert_eq!(mgr.owner(0xffff_8000_0000_0000), KERNEL_WORKER as u8);
        // Unclaimed superblocks have no owner yet.
        assert_eq!(mgr.owner(SUPERBLOCK_AREA_BASE), SUPERBLOCK_FREE);
    }

    #[test]
    fn test_allocate_superblocks_run() {
        let mgr = SuperblockManager::new();
        let first = mgr.allocate_superblocks(3).unwrap();
        // Claimed for CPU 0.
        for i in first..first + 3 {
            assert_eq!(mgr.superblocks[i].load(Ordering::Relaxed), 0);
        }
        // The next claim comes after the run.
        let second = mgr.allocate_superblocks(1).unwrap();
        assert!(second < first || second >= first + 3);
    }

    #[test]
    fn test_release_superblocks() {
        let mgr = SuperblockManager::new();
        let first = mgr.allocate_superblocks(2).unwrap();
        mgr.release_superblocks(first, 2);
        assert_eq!(
            mgr.superblocks[first].load(Ordering::Relaxed),
            SUPERBLOCK_FREE
        );
    }

    #[test]
    fn test_reserve_range_claims_and_reuses() {
        let mgr = SuperblockManager::new();
        let a = mgr.reserve_range(0x4000).unwrap();
        assert!(in_superblock_area(a));
        // The rest of the superblock is free for the next reservation;
        // first-fit hands out the tail, so no new superblock is claimed.
        let b = mgr.reserve_range(0x4000).unwrap();
        assert_ne!(a, b);
        assert_eq!(superblock_index(a), superblock_index(b));
    }

    #[test]
    fn test_reserve_range_multi_superblock() {
        let mgr = SuperblockManager::new();
        let a = mgr.reserve_range(SUPERBLOCK_SIZE + 0x1000).unwrap();
        assert!(in_superblock_area(a));
        assert_eq!(mgr.owner(a), mgr.owner(a + SUPERBLOCK_SIZE));
    }

    #[test]
    fn test_generate_owner_list_coalesces() {
        let mgr = SuperblockManager::new();
        let a = mgr.reserve_range(2 * SUPERBLOCK_SIZE).unwrap();
        let segs = mgr.generate_owner_list(a, 2 * SUPERBLOCK_SIZE);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], (a, 2 * SUPERBLOCK_SIZE, 0));
    }

    #[test]
    fn test_generate_owner_list_outside_area() {
        let mgr = SuperblockManager::new();
        let segs = mgr.generate_owner_list(0xffff_8000_0000_0000, 0x10_0000);
        assert_eq!(segs, [(0xffff_8000_0000_0000, 0x10_0000, KERNEL_WORKER as u8)]);
    }

    #[test]
    fn test_generate_owner_list_straddles_area_base() {
        let mgr = SuperblockManager::new();
        mgr.claim_superblock_at(SUPERBLOCK_AREA_BASE).unwrap();
        let start = SUPERBLOCK_AREA_BASE - 0x1000;
        let segs = mgr.generate_owner_list(start, 0x2000);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0], (start, 0x1000, KERNEL_WORKER as u8));
        assert_eq!(segs[1], (SUPERBLOCK_AREA_BASE, 0x1000, 0));
    }

    #[test]
    fn test_claim_superblock_at_feeds_free_ranges() {
        let mgr = SuperblockManager::new();
        let addr = superblock_addr(7);
        mgr.claim_superblock_at(addr).unwrap();
        assert_eq!(mgr.owner(addr), 0);
        assert!(mgr
            .free_ranges_lock(addr)
            .read()
            .contains(addr, SUPERBLOCK_SIZE));
    }

    #[test]
    fn test_procfs_maps_format() {
        let mgr = SuperblockManager::new();
        {
            let mut list = mgr.workers[KERNEL_WORKER].vma_list.write();
            list.insert(anon(0x2000_0000, 0x2000_2000));
        }
        let maps = mgr.procfs_maps();
        assert_eq!(maps, "20000000-20002000 rw-p 00000000 00:00 0\n");
    }
}
