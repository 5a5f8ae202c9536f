//! File collaborator contract and the in-tree shared-memory file.
//!
//! The file system proper lives outside this crate; mappable files reach
//! the VMM through the [`VmFile`] trait. A file either hands the VMM raw
//! bytes (`read_at`, used by the read-fill page provider) or, if it keeps
//! its own page cache, installs cache pages directly via `map_page`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use aos_hal::mem::{HUGE_PAGE_SIZE, PAGE_SIZE};
use aos_hal::mmu::{phys_to_virt, PtElement, Ptep};
use aos_hal::traits::page_allocator;
use aos_utils::Mutex;
use bitflags::bitflags;

use crate::VmError;

bitflags! {
    /// Access modes a file was opened with.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// File metadata the VMM needs at mapping time.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStat {
    pub size: u64,
    pub inode: u64,
    pub dev: u64,
}

/// A file object that can back a mapping.
pub trait VmFile: Send + Sync {
    /// Metadata snapshot.
    fn stat(&self) -> Result<FileStat, VmError>;

    /// Access modes the file handle was opened with.
    fn open_mode(&self) -> OpenMode {
        OpenMode::READ
    }

    /// Whether the file lives on a mount flagged no-exec.
    fn on_noexec_mount(&self) -> bool {
        false
    }

    /// Path for diagnostics (procfs); empty when anonymous.
    fn path(&self) -> &str {
        ""
    }

    /// Read into `buf` at `offset`; returns bytes read (short at EOF).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError>;

    /// Write `buf` at `offset`; returns bytes written. Only needed by
    /// files that back shared mappings without a page cache.
    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, VmError> {
        Err(VmError::AccessDenied)
    }

    /// Flush the given byte range to stable storage.
    fn sync_range(&self, _from: u64, _to: u64) -> Result<(), VmError> {
        Ok(())
    }

    /// Flush everything.
    fn fsync(&self) -> Result<(), VmError> {
        Ok(())
    }

    /// Whether the file keeps its own page cache and wants `map_page` /
    /// `put_page` instead of the read-fill provider.
    fn uses_page_cache(&self) -> bool {
        false
    }

    /// Install a cache page for file `offset` into `ptep` (CAS against the
    /// empty entry). `pte` carries permissions; the file fills in the
    /// address. Returns whether the entry was installed.
    fn map_page(
        &self,
        _offset: u64,
        _ptep: Ptep,
        _level: usize,
        _pte: PtElement,
        _write: bool,
        _shared: bool,
    ) -> bool {
        false
    }

    /// Drop the mapping installed for file `offset`. Returning false means
    /// the file keeps ownership of the page and the VMM must not free it.
    fn put_page(&self, _virt: usize, _offset: u64, _ptep: Ptep, _level: usize) -> bool {
        false
    }
}

// ============================================================================
// Shared memory file
// ============================================================================

/// An anonymous shared-memory file (the `MAP_SHARED | MAP_ANONYMOUS`
/// backing object), kept as a lazy map of zero-filled 2 MiB chunks.
///
/// Pages are owned by the file: `put_page` refuses the hand-back, and the
/// chunks are released when the file is dropped.
pub struct ShmFile {
    size: u64,
    chunks: Mutex<BTreeMap<u64, usize>>,
}

impl ShmFile {
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            size,
            chunks: Mutex::new(BTreeMap::new()),
        })
    }

    /// Physical address of the chunk covering huge-page-aligned `hp_off`,
    /// allocating and zeroing it on first touch.
    fn chunk(&self, hp_off: u64) -> Option<usize> {
        let mut chunks = self.chunks.lock();
        if let Some(&pa) = chunks.get(&hp_off) {
            return Some(pa);
        }
        let pa = page_allocator().alloc_huge_page(HUGE_PAGE_SIZE)?;
        // SAFETY: freshly allocated huge page, visible through the direct map.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa) as *mut u8, 0, HUGE_PAGE_SIZE);
        }
        chunks.insert(hp_off, pa);
        Some(pa)
    }
}

impl VmFile for ShmFile {
    fn stat(&self) -> Result<FileStat, VmError> {
        Ok(FileStat {
            size: self.size,
            inode: 0,
            dev: 0,
        })
    }

    fn open_mode(&self) -> OpenMode {
        OpenMode::READ | OpenMode::WRITE
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len() as u64, self.size - offset) as usize;
        let chunks = self.chunks.lock();
        for (i, b) in buf[..n].iter_mut().enumerate() {
            let off = offset + i as u64;
            let hp_off = off & !(HUGE_PAGE_SIZE as u64 - 1);
            *b = match chunks.get(&hp_off) {
                Some(&pa) => {
                    let p = phys_to_virt(pa + (off - hp_off) as usize) as *const u8;
                    // SAFETY: inside a live chunk.
                    unsafe { p.read() }
                }
                None => 0,
            };
        }
        Ok(n)
    }

    fn uses_page_cache(&self) -> bool {
        true
    }

    fn map_page(
        &self,
        offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        _write: bool,
        _shared: bool,
    ) -> bool {
        let hp_off = offset & !(HUGE_PAGE_SIZE as u64 - 1);
        if level > 0 {
            debug_assert_eq!(hp_off, offset);
        }
        let Some(chunk_pa) = self.chunk(hp_off) else {
            return false;
        };
        let pa = chunk_pa + (offset - hp_off) as usize;
        let mut pte = pte;
        pte.set_addr(pa);
        // A lost race means a concurrent fault installed the same cache
        // page; nothing to release.
        ptep.compare_exchange(PtElement::empty(), pte)
    }

    fn put_page(&self, _virt: usize, _offset: u64, ptep: Ptep, _level: usize) -> bool {
        ptep.write(PtElement::empty());
        // The page stays in the file's cache.
        false
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        let mut chunks = self.chunks.lock();
        for (_, pa) in core::mem::take(&mut *chunks) {
            page_allocator().free_huge_page(pa, HUGE_PAGE_SIZE);
        }
    }
}

// Keep the chunk map consistent with page-size arithmetic.
const _: () = assert!(HUGE_PAGE_SIZE % PAGE_SIZE == 0);
