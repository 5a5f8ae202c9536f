//! Architecture-neutral MMU facade.
//!
//! Re-exports the active architecture's MMU interface under one path so the
//! memory manager never names an architecture module directly.

pub use crate::x86_64::mmu::*;
