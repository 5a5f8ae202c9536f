//! Unit tests for the x86-64 MMU types.
//!
//! Gated on the `std` feature because this is a no_std crate.
//! Run with: cargo test -p aos-hal --features std

use super::constants::*;
use super::ops::*;
use super::types::*;
use super::MmuError;
use crate::mem::constants::{HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::traits::{page_allocator, set_page_allocator, PageAllocator};

// === Index extraction ===

#[test]
fn test_pt_index_levels() {
    assert_eq!(pt_index(0x0000_0000_0000_0000, 3), 0);
    assert_eq!(pt_index(0x0000_0080_0000_0000, 3), 1); // 512 GiB boundary
    assert_eq!(pt_index(0x0000_0000_4000_0000, 2), 1); // 1 GiB boundary
    assert_eq!(pt_index(0x0000_0000_0020_0000, 1), 1); // 2 MiB boundary
    assert_eq!(pt_index(0x0000_0000_0000_1000, 0), 1); // 4 KiB boundary
    assert_eq!(pt_index(0x0000_ff80_0000_0000, 3), 511);
}

#[test]
fn test_level_geometry() {
    assert_eq!(level_size(0), PAGE_SIZE);
    assert_eq!(level_size(1), HUGE_PAGE_SIZE);
    assert_eq!(level_size(2), 1 << 30);
    assert_eq!(level_shift(3), 39);
}

#[test]
fn test_pte_level_mask() {
    assert_eq!(pte_level_mask(0), !0xFFFusize);
    assert_eq!(pte_level_mask(1), !0x1F_FFFFusize);
}

#[test]
fn test_sign_extend_47() {
    assert_eq!(sign_extend_47(0x0000_7fff_ffff_f000), 0x0000_7fff_ffff_f000);
    assert_eq!(sign_extend_47(0x0000_8000_0000_0000), 0xffff_8000_0000_0000);
    assert_eq!(sign_extend_47(0), 0);
}

#[test]
fn test_phys_virt_identity_on_host() {
    // Host-test builds translate with the identity so page tables can live
    // in heap memory.
    assert_eq!(phys_to_virt(0x1234_5000), 0x1234_5000);
    assert_eq!(virt_to_phys(0x1234_5000), 0x1234_5000);
}

// === PtElement ===

#[test]
fn test_empty_pte() {
    let pte = make_empty_pte();
    assert!(pte.is_empty());
    assert!(!pte.valid());
    assert!(!pte.large());
    assert_eq!(pte.addr(), 0);
}

#[test]
fn test_leaf_pte_small() {
    let pte = make_leaf_pte(0, 0x4444_5000, true, false, Mattr::Normal);
    assert!(pte.valid());
    assert!(pte.writable());
    assert!(!pte.executable());
    assert!(!pte.large());
    assert_eq!(pte.addr(), 0x4444_5000);
}

#[test]
fn test_leaf_pte_large() {
    let pte = make_leaf_pte(1, 0x4440_0000, true, true, Mattr::Normal);
    assert!(pte.valid());
    assert!(pte.large());
    assert!(pte.executable());
    assert_eq!(pte.addr(), 0x4440_0000);
}

#[test]
fn test_leaf_pte_device_uncached() {
    let pte = make_leaf_pte(0, 0x9000_0000, true, false, Mattr::Device);
    assert!(pte.flags().contains(PteFlags::CACHE_DISABLE));
}

#[test]
fn test_intermediate_pte() {
    let pte = make_intermediate_pte(0x8_8000_1000);
    assert!(pte.valid());
    assert!(pte.writable());
    assert!(!pte.large());
    assert_eq!(pte.addr(), 0x8_8000_1000);
}

#[test]
fn test_cow_clears_writable() {
    let mut pte = make_leaf_pte(0, 0x1000, true, false, Mattr::Normal);
    pte.set_cow(true);
    assert!(pte.cow());
    assert!(!pte.writable());
}

#[test]
fn test_no_access_encoding() {
    let mut pte = make_leaf_pte(0, 0x1000, false, false, Mattr::Normal);
    pte.set_no_access(true);
    assert!(pte.valid());
    assert!(pte.no_access());
    pte.set_no_access(false);
    assert!(!pte.no_access());
}

#[test]
fn test_addr_update_preserves_flags() {
    let mut pte = make_leaf_pte(0, 0x1000, true, false, Mattr::Normal);
    pte.set_addr(0x7_7777_7000);
    assert_eq!(pte.addr(), 0x7_7777_7000);
    assert!(pte.valid());
    assert!(pte.writable());
    assert!(!pte.executable());
}

// === Ptep atomic access ===

#[test]
fn test_ptep_read_write() {
    let mut slot: u64 = 0;
    let ptep = unsafe { Ptep::from_raw(&mut slot) };
    assert!(ptep.read().is_empty());

    let pte = make_leaf_pte(0, 0x2000, true, false, Mattr::Normal);
    ptep.write(pte);
    assert_eq!(ptep.read(), pte);
    assert_eq!(ptep.ll_read(), pte);
}

#[test]
fn test_ptep_compare_exchange() {
    let mut slot: u64 = 0;
    let ptep = unsafe { Ptep::from_raw(&mut slot) };

    let a = make_leaf_pte(0, 0x3000, true, false, Mattr::Normal);
    let b = make_leaf_pte(0, 0x4000, true, false, Mattr::Normal);

    // First install against empty wins.
    assert!(ptep.compare_exchange(make_empty_pte(), a));
    // Second install against empty loses: the slot is taken.
    assert!(!ptep.compare_exchange(make_empty_pte(), b));
    assert_eq!(ptep.read(), a);
    // Exchange with the right expectation succeeds.
    assert!(ptep.compare_exchange(a, b));
    assert_eq!(ptep.read(), b);
}

// === PageTable ===

#[test]
fn test_page_table_layout() {
    assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);
    assert_eq!(core::mem::align_of::<PageTable>(), PAGE_SIZE);
    assert_eq!(core::mem::size_of::<PtElement>(), 8);
}

#[test]
fn test_page_table_empty_check() {
    let pt = PageTable::new();
    assert!(pt.is_empty());
    pt.slot(7).write(make_leaf_pte(0, 0x5000, false, false, Mattr::Normal));
    assert!(!pt.is_empty());
    pt.slot(7).write(make_empty_pte());
    assert!(pt.is_empty());
}

// === Table node allocation ===

extern crate std;

// Heap-backed frames: with identity translation any aligned heap block
// works as a physical table page.
struct HeapFrames;

impl PageAllocator for HeapFrames {
    fn alloc_page(&self) -> Option<usize> {
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: valid non-zero layout.
        let p = unsafe { std::alloc::alloc(layout) };
        if p.is_null() {
            None
        } else {
            Some(p as usize)
        }
    }

    fn free_page(&self, pa: usize) {
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: allocated in alloc_page with this layout.
        unsafe { std::alloc::dealloc(pa as *mut u8, layout) };
    }

    fn alloc_huge_page(&self, _size: usize) -> Option<usize> {
        None
    }

    fn free_huge_page(&self, _pa: usize, _size: usize) {}
}

static FRAMES: HeapFrames = HeapFrames;

#[test]
fn test_page_table_alloc_is_zeroed() {
    set_page_allocator(&FRAMES);
    let pa = PageTable::alloc().expect("table allocation");
    // SAFETY: pa was just allocated and stays live for the test.
    let table = unsafe { PageTable::from_pa(pa) };
    assert!(table.is_empty());

    table.slot(11).write(make_leaf_pte(0, 0x6000, true, false, Mattr::Normal));
    assert!(!table.is_empty());
    assert_eq!(table.slot(11).read().addr(), 0x6000);

    table.slot(11).write(make_empty_pte());
    assert!(table.is_empty());
    page_allocator().free_page(pa);
}

#[test]
fn test_mmu_error_codes() {
    assert_eq!(MmuError::AllocationFailed.code(), 0x0101);
    assert_eq!(MmuError::Misaligned.code(), 0x0102);
    assert_eq!(MmuError::AllocationFailed.class(), 0x01);
    assert_eq!(
        MmuError::AllocationFailed.message(),
        "page table allocation failed"
    );
}

// === Page fault code ===

#[test]
fn test_fault_code_bits() {
    let w = PageFaultCode::access(true);
    assert!(w.is_write());
    assert!(!w.is_insn_fetch());
    assert!(!w.is_present());

    let r = PageFaultCode::access(false);
    assert!(!r.is_write());

    let x = PageFaultCode::insn_fetch();
    assert!(x.is_insn_fetch());

    let prot = PageFaultCode::new(0b0011);
    assert!(prot.is_present());
    assert!(prot.is_write());
}

#[test]
fn test_tlb_flush_is_stubbed_on_host() {
    // Must be callable without faulting in a host test build.
    flush_tlb_all();
    ensure_next_two_stack_pages();
    synchronize_page_table_modifications();
}
