//! Memory management system calls.

use alloc::sync::Arc;

use aos_mm::{Advice, MmapFlags, Perm, VmFile};

use crate::errno;
use crate::{EINVAL, ENOMEM};

// mmap protection flags (matching Linux)
pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;
pub const PROT_EXEC: u32 = 4;

// mmap flags (matching Linux)
pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANONYMOUS: u32 = 0x20;
pub const MAP_POPULATE: u32 = 0x8000;
pub const MAP_UNINITIALIZED: u32 = 0x400_0000;

// madvise advice (matching Linux)
pub const MADV_DONTNEED: u32 = 4;
pub const MADV_NOHUGEPAGE: u32 = 15;

/// Convert PROT_* bits to mapping permissions.
fn prot_to_perm(prot: u32) -> Perm {
    let mut perm = Perm::empty();
    if prot & PROT_READ != 0 {
        perm |= Perm::READ;
    }
    if prot & PROT_WRITE != 0 {
        perm |= Perm::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        perm |= Perm::EXEC;
    }
    perm
}

/// Convert MAP_* bits to VMM mapping flags.
fn map_flags(flags: u32) -> MmapFlags {
    let mut f = MmapFlags::empty();
    if flags & MAP_FIXED != 0 {
        f |= MmapFlags::FIXED;
    }
    if flags & MAP_SHARED != 0 {
        f |= MmapFlags::SHARED;
    }
    if flags & MAP_POPULATE != 0 {
        f |= MmapFlags::POPULATE;
    }
    if flags & MAP_UNINITIALIZED != 0 {
        f |= MmapFlags::UNINITIALIZED;
    }
    f
}

/// sys_mmap for anonymous mappings.
///
/// File descriptors are resolved by the caller (the fd table lives in the
/// process layer); file-backed requests go through [`sys_mmap_file`].
pub fn sys_mmap(addr: usize, len: usize, prot: u32, flags: u32) -> i64 {
    if len == 0 {
        return -EINVAL;
    }
    if flags & MAP_ANONYMOUS == 0 {
        log::warn!("[MMAP] anonymous entry point called without MAP_ANONYMOUS, flags={flags:#x}");
        return -EINVAL;
    }

    match aos_mm::map_anon(addr, len, map_flags(flags), prot_to_perm(prot)) {
        Ok(va) => va as i64,
        Err(e) => errno(e),
    }
}

/// sys_mmap for file-backed mappings, with the file already resolved.
pub fn sys_mmap_file(
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    file: Arc<dyn VmFile>,
    offset: u64,
) -> i64 {
    if len == 0 || offset % aos_hal::mem::PAGE_SIZE as u64 != 0 {
        return -EINVAL;
    }
    match aos_mm::map_file(addr, len, map_flags(flags), prot_to_perm(prot), file, offset) {
        Ok(va) => va as i64,
        Err(e) => errno(e),
    }
}

/// sys_munmap.
pub fn sys_munmap(addr: usize, len: usize) -> i64 {
    match aos_mm::munmap(addr, len) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// sys_mprotect.
pub fn sys_mprotect(addr: usize, len: usize, prot: u32) -> i64 {
    match aos_mm::mprotect(addr, len, prot_to_perm(prot)) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// sys_msync.
pub fn sys_msync(addr: usize, len: usize, flags: i32) -> i64 {
    match aos_mm::msync(addr, len, flags) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// sys_madvise.
pub fn sys_madvise(addr: usize, len: usize, advice: u32) -> i64 {
    let advice = match advice {
        MADV_DONTNEED => Advice::DontNeed,
        MADV_NOHUGEPAGE => Advice::NoHugePage,
        _ => {
            log::warn!("[MADVISE] unsupported advice {advice}");
            return -EINVAL;
        }
    };
    match aos_mm::madvise(addr, len, advice) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}

/// sys_mincore.
pub fn sys_mincore(addr: usize, len: usize, vec: &mut [u8]) -> i64 {
    match aos_mm::mincore(addr, len, vec) {
        Ok(()) => 0,
        Err(e) => errno(e),
    }
}
