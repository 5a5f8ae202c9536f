//! Page fault entry point.
//!
//! The trap layer hands us the faulting address and the error-code word;
//! we answer with what should happen to the faulting thread. Actual signal
//! delivery (or the kernel-text crash dump) stays with the trap layer.

use core::sync::atomic::{AtomicUsize, Ordering};

use aos_hal::mem::page_align_down;
use aos_hal::mmu::PageFaultCode;

use crate::vma::{Perm, Vma};

/// Outcome of a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultStatus {
    /// The mapping was populated; retry the access.
    Handled,
    /// No mapping, or the access is incompatible with its permissions.
    SigSegv,
    /// File-backed access past EOF, or nothing could be populated for
    /// want of physical memory.
    SigBus,
}

// ============================================================================
// Fast SIGSEGV filter
// ============================================================================

// A thread that keeps faulting on the same dead page should not pay for a
// VMA lookup every time. The filter remembers the last few pages that
// produced SIGSEGV; mapping over such a page clears its entry.

const RECENT_SEGV_SLOTS: usize = 8;
const NO_ENTRY: usize = usize::MAX;

static RECENT_SEGV: [AtomicUsize; RECENT_SEGV_SLOTS] =
    [const { AtomicUsize::new(NO_ENTRY) }; RECENT_SEGV_SLOTS];
static RECENT_SEGV_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Record a page that just produced SIGSEGV.
pub fn note_sigsegv(addr: usize) {
    let page = page_align_down(addr);
    let slot = RECENT_SEGV_CURSOR.fetch_add(1, Ordering::Relaxed) % RECENT_SEGV_SLOTS;
    RECENT_SEGV[slot].store(page, Ordering::Relaxed);
}

/// Did this page recently produce SIGSEGV?
pub fn fast_sigsegv_check(addr: usize) -> bool {
    let page = page_align_down(addr);
    if page == NO_ENTRY {
        return false;
    }
    RECENT_SEGV
        .iter()
        .any(|s| s.load(Ordering::Relaxed) == page)
}

/// Forget recorded pages inside `[start, end)`; called when a new mapping
/// covers them.
pub fn forget_sigsegv_range(start: usize, end: usize) {
    for slot in &RECENT_SEGV {
        let page = slot.load(Ordering::Relaxed);
        if page >= start && page < end {
            let _ = slot.compare_exchange(page, NO_ENTRY, Ordering::Relaxed, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Access checks
// ============================================================================

/// Is the faulting access incompatible with the VMA's permissions?
pub fn access_fault(vma: &Vma, code: PageFaultCode) -> bool {
    let perm = vma.perm();
    if code.is_insn_fetch() {
        return !perm.contains(Perm::EXEC);
    }
    if code.is_write() {
        return !perm.contains(Perm::WRITE);
    }
    !perm.contains(Perm::READ)
}

// ============================================================================
// Entry point
// ============================================================================

/// Handle a fault at `addr`.
///
/// Takes the owning worker's VMA lock for read; populating under the read
/// lock is safe because leaf installs go through CAS on empty entries, so
/// concurrent faults on one page converge on a single backing page.
pub fn vm_fault(addr: usize, code: PageFaultCode) -> FaultStatus {
    if fast_sigsegv_check(addr) {
        log::trace!("[FAULT] fast sigsegv at {addr:#x}");
        return FaultStatus::SigSegv;
    }

    let addr = page_align_down(addr);
    let sbm = crate::sb_mgr();
    let list = sbm.vma_lock(addr).read();
    let Some(vma) = list.find_intersecting(addr) else {
        note_sigsegv(addr);
        log::debug!("[FAULT] no mapping at {addr:#x}, error {:#x}", code.raw());
        return FaultStatus::SigSegv;
    };
    if access_fault(vma, code) {
        // Not recorded in the fast filter: the mapping exists and a later
        // access of a compatible kind (or an mprotect) may succeed.
        log::debug!(
            "[FAULT] access at {addr:#x} incompatible with {:?}, error {:#x}",
            vma.perm(),
            code.raw()
        );
        return FaultStatus::SigSegv;
    }

    vma.fault(addr, code)
}
