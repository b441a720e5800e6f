#![doc = include_str!("./README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[path = "../src_rust/mod.rs"]
mod src_rust;

pub use src_rust::alloc::{
    ts_calloc, ts_free, ts_malloc, ts_realloc, Allocators, CallocFn, FreeFn, MallocFn, ReallocFn,
};
#[cfg(feature = "reuse-allocator")]
#[cfg_attr(docsrs, doc(cfg(feature = "reuse-allocator")))]
pub use src_rust::alloc::{
    current_allocators, reset_allocators, set_allocators, try_set_allocator_slots,
    ts_set_allocator,
};
pub use src_rust::error::{AllocatorError, AllocatorSlot, Result};
pub use src_rust::global::{TableAlloc, MIN_ALIGN};

/// Allocator set that records every live block and flags releases of
/// pointers it does not own.
pub mod tracking {
    pub use crate::src_rust::tracking::{
        allocators, block_size, is_live, reset_stats, stats, TrackingStats, ALLOCATORS,
    };
}
