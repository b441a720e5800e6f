//! An allocator set that keeps a registry of live blocks.
//!
//! Useful for embedders chasing leaks, and for catching ownership mistakes:
//! releasing a pointer that is not live (freed twice, or never obtained from
//! this set) is counted as misuse and the pointer is *not* handed to
//! `free`. The registry itself lives on the Rust global allocator, so this
//! set must not back a [`TableAlloc`](crate::TableAlloc) installed
//! as `#[global_allocator]`.

use core::ffi::c_void;
use std::collections::HashMap;

use parking_lot::Mutex;

use super::alloc::Allocators;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub allocations: usize,
    pub reallocations: usize,
    pub releases: usize,
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub misuses: usize,
}

#[derive(Default)]
struct Registry {
    live: HashMap<usize, usize>,
    stats: TrackingStats,
}

impl Registry {
    fn insert(&mut self, ptr: *mut c_void, size: usize) {
        self.live.insert(ptr as usize, size);
        self.stats.live_blocks = self.live.len();
        self.stats.live_bytes += size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
    }

    fn remove(&mut self, ptr: *mut c_void) -> Option<usize> {
        let size = self.live.remove(&(ptr as usize))?;
        self.stats.live_blocks = self.live.len();
        self.stats.live_bytes -= size;
        Some(size)
    }
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    f(guard.get_or_insert_with(Registry::default))
}

fn report_misuse(action: &str, ptr: *mut c_void) {
    tracing::error!(address = ?ptr, "{action} of a pointer that is not a live block");
}

/// The tracking set, backed by libc.
pub const ALLOCATORS: Allocators = Allocators {
    malloc: tracking_malloc,
    calloc: tracking_calloc,
    realloc: tracking_realloc,
    free: tracking_free,
};

pub fn allocators() -> Allocators {
    ALLOCATORS
}

/// Snapshot of the counters.
pub fn stats() -> TrackingStats {
    with_registry(|registry| registry.stats)
}

/// Zeroes the event counters. Blocks that are still live stay registered
/// and keep counting towards `live_*` and `peak_bytes`.
pub fn reset_stats() {
    with_registry(|registry| {
        let live_bytes = registry.stats.live_bytes;
        registry.stats = TrackingStats {
            live_blocks: registry.live.len(),
            live_bytes,
            peak_bytes: live_bytes,
            ..TrackingStats::default()
        };
    });
}

pub fn is_live(ptr: *const c_void) -> bool {
    with_registry(|registry| registry.live.contains_key(&(ptr as usize)))
}

/// Size recorded for a live block.
pub fn block_size(ptr: *const c_void) -> Option<usize> {
    with_registry(|registry| registry.live.get(&(ptr as usize)).copied())
}

unsafe extern "C" fn tracking_malloc(size: usize) -> *mut c_void {
    let ptr = unsafe { libc::malloc(size) };
    if !ptr.is_null() {
        with_registry(|registry| {
            registry.insert(ptr, size);
            registry.stats.allocations += 1;
        });
    }
    ptr
}

unsafe extern "C" fn tracking_calloc(count: usize, size: usize) -> *mut c_void {
    let ptr = unsafe { libc::calloc(count, size) };
    if !ptr.is_null() {
        // A non-null result means the product did not overflow.
        with_registry(|registry| {
            registry.insert(ptr, count * size);
            registry.stats.allocations += 1;
        });
    }
    ptr
}

unsafe extern "C" fn tracking_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return unsafe { tracking_malloc(size) };
    }

    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(Registry::default);
    if !registry.live.contains_key(&(ptr as usize)) {
        registry.stats.misuses += 1;
        drop(guard);
        report_misuse("realloc", ptr);
        return std::ptr::null_mut();
    }

    if size == 0 {
        registry.remove(ptr);
        registry.stats.releases += 1;
        drop(guard);
        unsafe { libc::free(ptr) };
        return std::ptr::null_mut();
    }

    // The lock is held across the call so no other thread can observe the
    // old address as live once libc has moved the block.
    let moved = unsafe { libc::realloc(ptr, size) };
    if !moved.is_null() {
        registry.remove(ptr);
        registry.insert(moved, size);
        registry.stats.reallocations += 1;
    }
    moved
}

unsafe extern "C" fn tracking_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let released = with_registry(|registry| match registry.remove(ptr) {
        Some(_) => {
            registry.stats.releases += 1;
            true
        }
        None => {
            registry.stats.misuses += 1;
            false
        }
    });
    if released {
        unsafe { libc::free(ptr) };
    } else {
        report_misuse("free", ptr);
    }
}
