//! Virtual memory areas.
//!
//! A `Vma` is one logically homogeneous mapping: a page-aligned half-open
//! range with uniform permissions, flags, and a page provider that supplies
//! its backing. Anonymous and file-backed variants differ in fault policy,
//! split behaviour, and msync handling.

use alloc::sync::Arc;

use aos_hal::mem::{
    huge_align_down, huge_align_up, page_align_down, page_align_up, HUGE_PAGE_SIZE, PAGE_SIZE,
};
use aos_hal::mmu::PageFaultCode;
use bitflags::bitflags;

use crate::fault::FaultStatus;
use crate::file::{OpenMode, VmFile};
use crate::provider::{FileMapped, FileRead, PageProvider, UninitializedAnonymous, ZeroedAnonymous};
use crate::VmError;

bitflags! {
    /// Mapping permissions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Perm {
    pub const fn rw() -> Self {
        Self::READ.union(Self::WRITE)
    }

    pub const fn rwx() -> Self {
        Self::rw().union(Self::EXEC)
    }
}

bitflags! {
    /// Mapping flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Map at the exact address given, evacuating whatever is there.
        const FIXED = 1 << 0;
        /// Populate the whole range eagerly at map time.
        const POPULATE = 1 << 1;
        /// Shared mapping: stores are visible through the backing file.
        const SHARED = 1 << 2;
        /// Skip zero-filling of anonymous pages.
        const UNINITIALIZED = 1 << 3;
        /// File-backed mapping.
        const FILE = 1 << 4;
        /// Never use huge pages for this mapping.
        const SMALL = 1 << 5;
        /// Reserved: JVM heap region (balloon machinery not built).
        const JVM_HEAP = 1 << 6;
        /// Reserved: JVM balloon region (balloon machinery not built).
        const JVM_BALLOON = 1 << 7;
    }
}

/// Half-open, page-aligned `[start, end)` address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrRange {
    start: usize,
    end: usize,
}

impl AddrRange {
    /// Construct, aligning start down and end up to page granularity.
    pub fn new(start: usize, end: usize) -> Self {
        let start = page_align_down(start);
        let end = page_align_up(end);
        debug_assert!(start <= end);
        Self { start, end }
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub const fn intersects(&self, other: &AddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// What backs a VMA.
pub enum Backing {
    Anonymous,
    File {
        file: Arc<dyn VmFile>,
        offset: u64,
        inode: u64,
        dev: u64,
        /// Whether the file hands out its own cache pages (`FileMapped`
        /// provider) rather than being copied through `FileRead`.
        cached: bool,
    },
}

/// One virtual memory area.
pub struct Vma {
    range: AddrRange,
    perm: Perm,
    flags: MmapFlags,
    map_dirty: bool,
    page_ops: Arc<dyn PageProvider>,
    backing: Backing,
}

impl Vma {
    /// Anonymous mapping. Private anonymous memory is mapped dirty: there
    /// is no backing store to sync it against.
    pub fn anon(range: AddrRange, perm: Perm, flags: MmapFlags) -> Self {
        let page_ops: Arc<dyn PageProvider> = if flags.contains(MmapFlags::UNINITIALIZED) {
            Arc::new(UninitializedAnonymous)
        } else {
            Arc::new(ZeroedAnonymous)
        };
        Self {
            range,
            perm,
            flags,
            map_dirty: true,
            page_ops,
            backing: Backing::Anonymous,
        }
    }

    /// Zero-sized boundary marker; never matches a lookup.
    pub fn sentinel(addr: usize) -> Self {
        Self::anon(AddrRange::new(addr, addr), Perm::empty(), MmapFlags::empty())
    }

    /// File-backed mapping at file `offset`. Validates the requested
    /// permissions against the file's open mode and mount flags.
    pub fn file(
        range: AddrRange,
        perm: Perm,
        flags: MmapFlags,
        file: Arc<dyn VmFile>,
        offset: u64,
    ) -> Result<Self, VmError> {
        let flags = flags | MmapFlags::FILE;
        let shared = flags.contains(MmapFlags::SHARED);
        let stat = file.stat()?;
        let cached = file.uses_page_cache();
        let vma = Self {
            range,
            perm,
            flags,
            // Shared file pages are cleaned by msync; private copies have
            // nothing to write back, so they are born dirty.
            map_dirty: !shared,
            page_ops: Self::file_page_ops(&file, offset, shared, cached),
            backing: Backing::File {
                file,
                offset,
                inode: stat.inode,
                dev: stat.dev,
                cached,
            },
        };
        vma.validate_perm(perm)?;
        Ok(vma)
    }

    fn file_page_ops(
        file: &Arc<dyn VmFile>,
        offset: u64,
        shared: bool,
        cached: bool,
    ) -> Arc<dyn PageProvider> {
        if cached {
            Arc::new(FileMapped::new(Arc::clone(file), offset, shared))
        } else {
            Arc::new(FileRead::new(Arc::clone(file), offset))
        }
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.range.start()
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.range.end()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.range.size()
    }

    #[must_use]
    pub fn range(&self) -> AddrRange {
        self.range
    }

    #[must_use]
    pub fn perm(&self) -> Perm {
        self.perm
    }

    #[must_use]
    pub fn flags(&self) -> MmapFlags {
        self.flags
    }

    #[must_use]
    pub fn has_flags(&self, f: MmapFlags) -> bool {
        self.flags.intersects(f)
    }

    /// Set additional flags. Caller must hold the owning worker's VMA lock
    /// for write.
    pub fn update_flags(&mut self, f: MmapFlags) {
        self.flags |= f;
    }

    #[must_use]
    pub fn map_dirty(&self) -> bool {
        self.map_dirty
    }

    pub fn page_ops(&self) -> &dyn PageProvider {
        &*self.page_ops
    }

    #[must_use]
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// A zero-sized boundary marker?
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.range.size() == 0
    }

    /// Replace the range (both edges page-aligned by construction).
    pub fn set(&mut self, start: usize, end: usize) {
        self.range = AddrRange::new(start, end);
    }

    /// Record new permissions; the page tables are rewritten separately.
    pub fn protect(&mut self, perm: Perm) {
        self.perm = perm;
    }

    /// File offset corresponding to `addr` within this mapping.
    #[must_use]
    pub fn file_offset(&self, addr: usize) -> u64 {
        debug_assert!(addr >= self.start());
        match &self.backing {
            Backing::File { offset, .. } => offset + (addr - self.start()) as u64,
            Backing::Anonymous => (addr - self.start()) as u64,
        }
    }

    /// Check whether `perm` can be granted on this mapping.
    ///
    /// Fails with `AccessDenied` when the file is not open for reading, or
    /// a shared writable mapping is requested on a file not open for
    /// writing; with `NotPermitted` for exec on a no-exec mount.
    pub fn validate_perm(&self, perm: Perm) -> Result<(), VmError> {
        let Backing::File { file, .. } = &self.backing else {
            return Ok(());
        };
        let mode = file.open_mode();
        if !mode.contains(OpenMode::READ) {
            return Err(VmError::AccessDenied);
        }
        if perm.contains(Perm::WRITE)
            && self.flags.contains(MmapFlags::SHARED)
            && !mode.contains(OpenMode::WRITE)
        {
            return Err(VmError::AccessDenied);
        }
        if perm.contains(Perm::EXEC) && file.on_noexec_mount() {
            return Err(VmError::NotPermitted);
        }
        Ok(())
    }

    /// Cut this VMA at `edge`, shrinking it to `[start, edge)` and
    /// returning the tail `[edge, end)` with the same attributes.
    /// The caller inserts the tail into the same worker's index.
    pub fn split_off(&mut self, edge: usize) -> Vma {
        debug_assert!(edge > self.start() && edge < self.end());
        let tail_range = AddrRange::new(edge, self.end());
        let tail = match &self.backing {
            Backing::Anonymous => Vma::anon(tail_range, self.perm, self.flags),
            Backing::File {
                file,
                inode,
                dev,
                cached,
                ..
            } => {
                let off = self.file_offset(edge);
                let shared = self.flags.contains(MmapFlags::SHARED);
                Vma {
                    range: tail_range,
                    perm: self.perm,
                    flags: self.flags,
                    map_dirty: self.map_dirty,
                    page_ops: Self::file_page_ops(file, off, shared, *cached),
                    backing: Backing::File {
                        file: Arc::clone(file),
                        offset: off,
                        inode: *inode,
                        dev: *dev,
                        cached: *cached,
                    },
                }
            }
        };
        self.set(self.start(), edge);
        tail
    }

    /// A clone of this VMA's attributes restricted to `range`; used when a
    /// fixed request is carved along worker territory boundaries.
    pub fn carve(&self, range: AddrRange) -> Vma {
        debug_assert!(range.start() >= self.start() && range.end() <= self.end());
        match &self.backing {
            Backing::Anonymous => Vma::anon(range, self.perm, self.flags),
            Backing::File {
                file,
                inode,
                dev,
                cached,
                ..
            } => {
                let off = self.file_offset(range.start());
                let shared = self.flags.contains(MmapFlags::SHARED);
                Vma {
                    range,
                    perm: self.perm,
                    flags: self.flags,
                    map_dirty: self.map_dirty,
                    page_ops: Self::file_page_ops(file, off, shared, *cached),
                    backing: Backing::File {
                        file: Arc::clone(file),
                        offset: off,
                        inode: *inode,
                        dev: *dev,
                        cached: *cached,
                    },
                }
            }
        }
    }

    /// Handle a fault at page-aligned `addr` inside this mapping.
    ///
    /// Called with the owning worker's VMA lock held for read; population
    /// is safe under the read lock because leaf installs go through CAS.
    pub fn fault(&self, addr: usize, code: PageFaultCode) -> FaultStatus {
        let hp_start = huge_align_up(self.start());
        let hp_end = huge_align_down(self.end());

        let mut addr = addr;
        let mut size = PAGE_SIZE;
        let huge_ok = !self.has_flags(MmapFlags::SMALL | MmapFlags::JVM_BALLOON)
            && hp_start <= addr
            && addr < hp_end;

        if let Backing::File { file, .. } = &self.backing {
            let fsize = file.stat().map(|s| s.size).unwrap_or(0);
            if self.file_offset(addr) >= fsize {
                return FaultStatus::SigBus;
            }
            if huge_ok && self.file_offset(hp_end) < fsize {
                addr = huge_align_down(addr);
                size = HUGE_PAGE_SIZE;
            }
        } else if huge_ok {
            addr = huge_align_down(addr);
            size = HUGE_PAGE_SIZE;
        }

        match crate::api::populate_vma(self, addr, size, code.is_write()) {
            Ok(_) => FaultStatus::Handled,
            // Nothing could be populated for want of physical memory; the
            // fault path has no caller to return to.
            Err(_) => FaultStatus::SigBus,
        }
    }

    /// msync a sub-range. Anonymous mappings have no backing store.
    pub fn sync(&self, start: usize, end: usize) -> Result<(), VmError> {
        crate::api::sync_vma(self, start, end)
    }
}
