//! `GlobalAlloc` on top of the allocator table.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use super::alloc::{ts_calloc, ts_free, ts_malloc, ts_realloc};

/// Alignment every libc `malloc` result satisfies.
#[cfg(target_pointer_width = "64")]
pub const MIN_ALIGN: usize = 16;
#[cfg(not(target_pointer_width = "64"))]
pub const MIN_ALIGN: usize = 8;

/// Routes Rust allocations through [`ts_malloc`] and friends, so collections
/// owned by the library follow whatever table the embedder installed.
///
/// The table has no aligned-allocation slot; layouts aligned beyond
/// [`MIN_ALIGN`] produce null. Smaller requests are rounded up to their
/// alignment, which `malloc` then satisfies.
#[derive(Clone, Copy, Debug, Default)]
pub struct TableAlloc;

#[inline]
fn malloc_size(layout: Layout) -> Option<usize> {
    (layout.align() <= MIN_ALIGN).then(|| layout.size().max(layout.align()))
}

unsafe impl GlobalAlloc for TableAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match malloc_size(layout) {
            Some(size) => unsafe { ts_malloc(size) as *mut u8 },
            None => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        match malloc_size(layout) {
            Some(size) => unsafe { ts_calloc(1, size) as *mut u8 },
            None => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { ts_free(ptr.cast()) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // `alloc` never hands out blocks aligned beyond MIN_ALIGN, so `ptr`
        // has a malloc-compatible layout and `realloc` keeps its alignment.
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        unsafe { ts_realloc(ptr.cast(), new_size.max(layout.align())) as *mut u8 }
    }
}
