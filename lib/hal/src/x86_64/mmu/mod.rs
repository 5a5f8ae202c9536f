//! x86-64 Memory Management Unit (MMU) support.
//!
//! Implements the 4-level, 48-bit, 4 KiB-granule page table format with
//! 2 MiB large pages at level 1.
//!
//! # Module Structure
//!
//! - `constants`: table geometry, direct-map window, index extraction
//! - `types`: PtElement, PteFlags, Ptep, PageTable
//! - `ops`: TLB maintenance, fault error-code decoding, stack pre-touch

pub mod constants;
pub mod ops;
pub mod types;

#[cfg(test)]
mod tests;

pub use constants::*;
pub use ops::*;
pub use types::*;

use aos_error::define_kernel_error;

define_kernel_error! {
    /// MMU error type (class 0x01).
    pub enum MmuError(0x01) {
        /// Page table allocation failed
        AllocationFailed = 0x01 => "page table allocation failed",
        /// Address not aligned to the mapping granule
        Misaligned = 0x02 => "address not properly aligned",
    }
}
