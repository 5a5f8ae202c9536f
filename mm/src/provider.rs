//! Page providers: the policies that supply and retract backing pages.
//!
//! A provider installs leaf entries with a compare-exchange against the
//! empty entry, so two CPUs faulting on the same page race cleanly: the
//! loser frees its freshly allocated page and reports "already mapped".
//! Providers never hold VMA locks.

use alloc::sync::Arc;

use aos_hal::mem::PAGE_SIZE;
use aos_hal::mmu::{level_size, phys_to_virt, PtElement, Ptep};
use aos_hal::traits::page_allocator;

use crate::file::VmFile;
use crate::VmError;

/// Supplies backing pages for `populate` and takes them back for
/// `unpopulate`.
pub trait PageProvider: Send + Sync {
    /// Back the entry at `ptep` (leaf at `level`) for the page at `offset`
    /// bytes into the mapping. `pte` carries permissions and dirty state;
    /// the provider fills in the physical address.
    ///
    /// Returns `Ok(true)` if this call installed the mapping, `Ok(false)`
    /// if a concurrent install won the race, and `Err` if no page could be
    /// obtained.
    fn map(
        &self,
        offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        write: bool,
    ) -> Result<bool, VmError>;

    /// Retract the mapping at `ptep`. `virt` is the direct-map address of
    /// the backing page. Returns whether the caller now owns the page and
    /// must free it (after the TLB flush).
    fn unmap(&self, virt: usize, offset: u64, ptep: Ptep, level: usize) -> bool;
}

// ============================================================================
// Anonymous providers
// ============================================================================

fn alloc_level(level: usize) -> Option<usize> {
    if level == 0 {
        page_allocator().alloc_page()
    } else {
        page_allocator().alloc_huge_page(level_size(level))
    }
}

fn free_level(pa: usize, level: usize) {
    if level == 0 {
        page_allocator().free_page(pa);
    } else {
        page_allocator().free_huge_page(pa, level_size(level));
    }
}

/// CAS-install `pa` behind `pte`; on a lost race the fresh page goes back.
fn install(pa: usize, ptep: Ptep, mut pte: PtElement, level: usize) -> bool {
    pte.set_addr(pa);
    if ptep.compare_exchange(PtElement::empty(), pte) {
        true
    } else {
        free_level(pa, level);
        false
    }
}

/// Anonymous memory, no fill: the caller reads whatever the physical
/// allocator hands out (`MAP_UNINITIALIZED`).
pub struct UninitializedAnonymous;

impl PageProvider for UninitializedAnonymous {
    fn map(
        &self,
        _offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        _write: bool,
    ) -> Result<bool, VmError> {
        let pa = alloc_level(level).ok_or(VmError::OutOfMemory)?;
        Ok(install(pa, ptep, pte, level))
    }

    fn unmap(&self, _virt: usize, _offset: u64, ptep: Ptep, _level: usize) -> bool {
        ptep.write(PtElement::empty());
        true
    }
}

/// Anonymous memory, zero-filled before install.
pub struct ZeroedAnonymous;

impl PageProvider for ZeroedAnonymous {
    fn map(
        &self,
        _offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        _write: bool,
    ) -> Result<bool, VmError> {
        let size = level_size(level);
        let pa = alloc_level(level).ok_or(VmError::OutOfMemory)?;
        // SAFETY: freshly allocated, visible through the direct map.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa) as *mut u8, 0, size);
        }
        Ok(install(pa, ptep, pte, level))
    }

    fn unmap(&self, _virt: usize, _offset: u64, ptep: Ptep, _level: usize) -> bool {
        ptep.write(PtElement::empty());
        true
    }
}

// ============================================================================
// File-backed providers
// ============================================================================

/// Fill pages by reading the file; used when the underlying file system has
/// no shared page cache. Short reads are zero-padded.
pub struct FileRead {
    file: Arc<dyn VmFile>,
    foffset: u64,
}

impl FileRead {
    pub fn new(file: Arc<dyn VmFile>, foffset: u64) -> Self {
        Self { file, foffset }
    }
}

impl PageProvider for FileRead {
    fn map(
        &self,
        offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        _write: bool,
    ) -> Result<bool, VmError> {
        let size = level_size(level);
        let pa = alloc_level(level).ok_or(VmError::OutOfMemory)?;
        // SAFETY: freshly allocated backing of `size` bytes.
        let buf = unsafe { core::slice::from_raw_parts_mut(phys_to_virt(pa) as *mut u8, size) };
        match self.file.read_at(buf, self.foffset + offset) {
            Ok(n) => {
                if n < size {
                    buf[n..].fill(0);
                }
            }
            Err(e) => {
                free_level(pa, level);
                return Err(e);
            }
        }
        Ok(install(pa, ptep, pte, level))
    }

    fn unmap(&self, _virt: usize, _offset: u64, ptep: Ptep, _level: usize) -> bool {
        ptep.write(PtElement::empty());
        true
    }
}

/// Delegate mapping to the file's own page cache.
pub struct FileMapped {
    file: Arc<dyn VmFile>,
    foffset: u64,
    shared: bool,
}

impl FileMapped {
    pub fn new(file: Arc<dyn VmFile>, foffset: u64, shared: bool) -> Self {
        Self {
            file,
            foffset,
            shared,
        }
    }
}

impl PageProvider for FileMapped {
    fn map(
        &self,
        offset: u64,
        ptep: Ptep,
        level: usize,
        pte: PtElement,
        write: bool,
    ) -> Result<bool, VmError> {
        Ok(self
            .file
            .map_page(self.foffset + offset, ptep, level, pte, write, self.shared))
    }

    fn unmap(&self, virt: usize, offset: u64, ptep: Ptep, level: usize) -> bool {
        self.file.put_page(virt, self.foffset + offset, ptep, level)
    }
}

const _: () = assert!(PAGE_SIZE == level_size(0));
