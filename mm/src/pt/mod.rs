//! Page-table traversal machinery.
//!
//! `walker` drives a range over the 4-level table; `ops` are the concrete
//! algorithms plugged into it (populate, unpopulate, protect, dirty-clean,
//! probe, cleanup, split, linear-map).

pub mod ops;
pub mod walker;

pub use ops::*;
pub use walker::{map_range, operate_range, PageOp, PageTableRoot};
