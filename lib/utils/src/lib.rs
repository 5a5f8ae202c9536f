//! Shared kernel utilities.
//!
//! The lock vocabulary for the whole tree lives here so that swapping the
//! underlying implementation (ticket locks, preemption-aware locks) stays a
//! one-crate change. Everything is currently backed by `spin`.

#![no_std]

pub use spin::{Mutex, MutexGuard, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Alias kept for call sites that want to make busy-waiting explicit.
pub type Spinlock<T> = spin::Mutex<T>;
