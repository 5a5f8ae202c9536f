//! Test support: a heap-backed frame "allocator".
//!
//! With the HAL in std mode phys/virt translation is the identity, so any
//! naturally aligned heap block works as a physical page. Huge allocations
//! are tracked at page granularity because splitting a huge page lets the
//! VMM free it in 4 KiB pieces.

extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::Mutex;

use aos_hal::mem::{HUGE_PAGE_SIZE, PAGE_SIZE};
use aos_hal::traits::{set_page_allocator, PageAllocator};
use aos_utils::Once;

pub struct TestFrames {
    outstanding: AtomicUsize,
    // huge chunk base -> pages not yet freed
    huge: Mutex<BTreeMap<usize, usize>>,
}

impl TestFrames {
    const fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            huge: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bytes currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl PageAllocator for TestFrames {
    fn alloc_page(&self) -> Option<usize> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: valid non-zero layout.
        let p = unsafe { alloc(layout) };
        if p.is_null() {
            return None;
        }
        self.outstanding.fetch_add(PAGE_SIZE, Ordering::SeqCst);
        Some(p as usize)
    }

    fn free_page(&self, pa: usize) {
        self.outstanding.fetch_sub(PAGE_SIZE, Ordering::SeqCst);
        let mut huge = self.huge.lock().unwrap();
        // A 4 KiB piece of a split huge allocation: the chunk can only go
        // back to the heap once every piece is gone.
        if let Some((&base, left)) = huge.range_mut(..=pa).next_back() {
            if pa < base + HUGE_PAGE_SIZE {
                *left -= 1;
                if *left == 0 {
                    huge.remove(&base);
                    let layout = Layout::from_size_align(HUGE_PAGE_SIZE, HUGE_PAGE_SIZE).unwrap();
                    // SAFETY: allocated in alloc_huge_page with this layout.
                    unsafe { dealloc(base as *mut u8, layout) };
                }
                return;
            }
        }
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: allocated in alloc_page with this layout.
        unsafe { dealloc(pa as *mut u8, layout) };
    }

    fn alloc_huge_page(&self, size: usize) -> Option<usize> {
        assert_eq!(size, HUGE_PAGE_SIZE);
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: valid non-zero layout.
        let p = unsafe { alloc(layout) };
        if p.is_null() {
            return None;
        }
        self.outstanding.fetch_add(size, Ordering::SeqCst);
        self.huge
            .lock()
            .unwrap()
            .insert(p as usize, size / PAGE_SIZE);
        Some(p as usize)
    }

    fn free_huge_page(&self, pa: usize, size: usize) {
        assert_eq!(size, HUGE_PAGE_SIZE);
        self.outstanding.fetch_sub(size, Ordering::SeqCst);
        let removed = self.huge.lock().unwrap().remove(&pa);
        assert!(removed.is_some(), "free_huge_page of unknown chunk");
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: allocated in alloc_huge_page with this layout.
        unsafe { dealloc(pa as *mut u8, layout) };
    }
}

static FRAMES: TestFrames = TestFrames::new();
static INSTALL: Once<()> = Once::new();

/// Install the shared test allocator (idempotent) and return it.
pub fn frames() -> &'static TestFrames {
    INSTALL.call_once(|| set_page_allocator(&FRAMES));
    &FRAMES
}
