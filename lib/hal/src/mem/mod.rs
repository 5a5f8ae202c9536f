//! Memory-related constants and utilities.
//!
//! Centralized so PAGE_SIZE and friends have a single definition across the
//! kernel.

pub mod constants;

pub use constants::{
    huge_align_down, huge_align_up, is_huge_aligned, is_page_aligned, page_align_down,
    page_align_up, pages_needed, HUGE_PAGE_MASK, HUGE_PAGE_SHIFT, HUGE_PAGE_SIZE, PAGE_MASK,
    PAGE_SHIFT, PAGE_SIZE,
};
