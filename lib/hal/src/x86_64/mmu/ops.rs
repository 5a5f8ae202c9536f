//! MMU operations for x86-64.
//!
//! TLB maintenance, page-fault error-code decoding, and the lazy-stack
//! pre-touch. The assembly bodies are stubbed on host-test builds.

// ============================================================================
// TLB maintenance
// ============================================================================

/// Flush all non-global TLB entries on this CPU by reloading CR3.
#[cfg(not(any(feature = "std", test)))]
pub fn flush_tlb_all() {
    // SAFETY: reloading CR3 with its current value only invalidates cached
    // translations; the next access re-walks the page tables.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(any(feature = "std", test))]
pub fn flush_tlb_all() {
    // Stub for host test builds.
}

/// Make page-table stores visible before newly mapped memory is touched.
/// x86-64 page-table walks are coherent with stores; nothing to do.
#[inline]
pub fn synchronize_page_table_modifications() {}

// ============================================================================
// Lazy stack pre-touch
// ============================================================================

/// Touch the next two pages below the stack pointer.
///
/// Required before taking any VMA lock for write: a fault on a lazily
/// populated stack inside the write-locked region would re-enter the fault
/// handler, which takes the same lock for read, and deadlock.
#[cfg(all(feature = "lazy-stack", not(any(feature = "std", test))))]
pub fn ensure_next_two_stack_pages() {
    // SAFETY: reads below RSP stay within the current thread's stack
    // reservation; the loads exist only to force population.
    unsafe {
        core::arch::asm!(
            "mov {a}, rsp",
            "sub {a}, 4096",
            "mov {s}, [{a}]",
            "sub {a}, 4096",
            "mov {s}, [{a}]",
            a = out(reg) _,
            s = out(reg) _,
            options(nostack, readonly)
        );
    }
}

#[cfg(not(all(feature = "lazy-stack", not(any(feature = "std", test)))))]
pub fn ensure_next_two_stack_pages() {
    // Eager stacks (or host tests): the invariant holds trivially.
}

// ============================================================================
// Page fault error code
// ============================================================================

/// The error-code word pushed by the CPU on a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageFaultCode(u64);

impl PageFaultCode {
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const RSVD: u64 = 1 << 3;
    const INSN: u64 = 1 << 4;

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Convenience constructor for the fault paths: a data access.
    pub const fn access(write: bool) -> Self {
        Self(if write { Self::WRITE } else { 0 })
    }

    /// Convenience constructor: an instruction fetch.
    pub const fn insn_fetch() -> Self {
        Self(Self::INSN)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Fault was caused by a protection violation (entry was present).
    pub const fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Fault was caused by a write access.
    pub const fn is_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Fault came from user mode.
    pub const fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    /// Fault hit a reserved bit (PROT_NONE encoding).
    pub const fn is_rsvd(self) -> bool {
        self.0 & Self::RSVD != 0
    }

    /// Fault was an instruction fetch.
    pub const fn is_insn_fetch(self) -> bool {
        self.0 & Self::INSN != 0
    }
}
