//! Collaborator hooks.
//!
//! The HAL does not implement the physical page allocator, RCU, or the
//! scheduler; the kernel that links the VMM installs them once during boot.
//! Until a hook is installed a sensible boot-time default applies.

use spin::Once;

// ============================================================================
// Physical page allocator
// ============================================================================

/// Physical page allocator contract.
///
/// All methods may fail by returning `None`; the VMM turns that into
/// an out-of-memory error (or SIGBUS on the fault path).
pub trait PageAllocator: Sync {
    /// Allocate one 4 KiB page; returns its physical address.
    fn alloc_page(&self) -> Option<usize>;

    /// Free one 4 KiB page. Freeing a 4 KiB piece of a huge page is legal;
    /// the allocator tracks huge allocations at page granularity.
    fn free_page(&self, pa: usize);

    /// Allocate `size` bytes of naturally aligned contiguous memory
    /// (used with the 2 MiB huge page size).
    fn alloc_huge_page(&self, size: usize) -> Option<usize>;

    /// Free a huge allocation as a whole.
    fn free_huge_page(&self, pa: usize, size: usize);
}

static PAGE_ALLOCATOR: Once<&'static dyn PageAllocator> = Once::new();

/// Install the global page allocator. Called once during boot, after the
/// physical memory map is known.
pub fn set_page_allocator(allocator: &'static dyn PageAllocator) {
    PAGE_ALLOCATOR.call_once(|| allocator);
}

/// The installed page allocator. Calling into the VMM before
/// `set_page_allocator` is a boot-order bug.
pub fn page_allocator() -> &'static dyn PageAllocator {
    *PAGE_ALLOCATOR
        .get()
        .expect("page allocator used before set_page_allocator")
}

// ============================================================================
// RCU
// ============================================================================

/// Read-copy-update provider.
///
/// The VMM uses RCU for exactly one thing: deferring the reclaim of
/// intermediate page-table pages so concurrent lock-free walkers never
/// dereference a freed table.
pub trait RcuProvider: Sync {
    /// Run `func(arg)` after the current grace period.
    fn defer(&self, func: fn(usize), arg: usize);

    /// Enter a read-side critical section.
    fn read_lock(&self) {}

    /// Leave a read-side critical section.
    fn read_unlock(&self) {}
}

static RCU: Once<&'static dyn RcuProvider> = Once::new();

/// Install the RCU provider. Until this is called, deferred work runs
/// immediately, which is correct while only the boot CPU is alive.
pub fn set_rcu_provider(rcu: &'static dyn RcuProvider) {
    RCU.call_once(|| rcu);
}

/// Queue `func(arg)` to run after a grace period.
pub fn rcu_defer(func: fn(usize), arg: usize) {
    match RCU.get() {
        Some(rcu) => rcu.defer(func, arg),
        None => func(arg),
    }
}

/// RAII read-side critical section.
pub struct RcuReadGuard(());

impl Drop for RcuReadGuard {
    fn drop(&mut self) {
        if let Some(rcu) = RCU.get() {
            rcu.read_unlock();
        }
    }
}

/// Enter an RCU read-side critical section for the guard's lifetime.
pub fn rcu_read_lock() -> RcuReadGuard {
    if let Some(rcu) = RCU.get() {
        rcu.read_lock();
    }
    RcuReadGuard(())
}

// ============================================================================
// CPU identity
// ============================================================================

static CPU_ID: Once<fn() -> usize> = Once::new();

/// Install the scheduler's CPU-id query. Before the scheduler is up
/// everything runs on CPU 0.
pub fn set_cpu_id_provider(f: fn() -> usize) {
    CPU_ID.call_once(|| f);
}

/// Id of the CPU this thread currently runs on.
pub fn current_cpu_id() -> usize {
    match CPU_ID.get() {
        Some(f) => f(),
        None => 0,
    }
}
