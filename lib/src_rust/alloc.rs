//! Allocator indirection for every heap-owning part of the library.
//!
//! With the `reuse-allocator` feature (the default) all allocations go
//! through a process-wide [`Allocators`] table that embedders may replace
//! with [`set_allocators`] or the C entry point [`ts_set_allocator`]. Without
//! it, [`ts_malloc`] and friends call libc directly and no table exists.

use core::ffi::c_void;
use std::fmt;

#[cfg(feature = "reuse-allocator")]
use std::sync::atomic::{AtomicPtr, Ordering};

#[cfg(feature = "reuse-allocator")]
use parking_lot::Mutex;

#[cfg(feature = "reuse-allocator")]
use super::error::{AllocatorError, AllocatorSlot, Result};

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// A complete set of allocation primitives.
///
/// Every slot is a non-null function pointer, so a table can never be
/// partially empty. Blocks obtained from one table's `malloc`, `calloc` or
/// `realloc` must be returned to the same table's `free`.
#[derive(Clone, Copy)]
pub struct Allocators {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
}

impl Allocators {
    /// The libc primitives, unmodified.
    pub const PLATFORM: Self = Self {
        malloc: libc::malloc,
        calloc: libc::calloc,
        realloc: libc::realloc,
        free: libc::free,
    };

    /// The libc primitives, aborting the process when a non-empty request
    /// cannot be satisfied.
    pub const ABORTING: Self = Self {
        malloc: ts_malloc_aborting,
        calloc: ts_calloc_aborting,
        realloc: ts_realloc_aborting,
        free: libc::free,
    };

    pub const fn new(malloc: MallocFn, calloc: CallocFn, realloc: ReallocFn, free: FreeFn) -> Self {
        Self {
            malloc,
            calloc,
            realloc,
            free,
        }
    }

    /// # Safety
    /// The returned block must be released with [`Allocators::release`] on a
    /// table sharing this `free`.
    #[inline]
    pub unsafe fn allocate(&self, size: usize) -> *mut c_void {
        unsafe { (self.malloc)(size) }
    }

    /// # Safety
    /// See [`Allocators::allocate`].
    #[inline]
    pub unsafe fn zeroed(&self, count: usize, size: usize) -> *mut c_void {
        unsafe { (self.calloc)(count, size) }
    }

    /// # Safety
    /// `ptr` must be null or a live block from this table.
    #[inline]
    pub unsafe fn reallocate(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        unsafe { (self.realloc)(ptr, size) }
    }

    /// # Safety
    /// `ptr` must be null or a live block from this table, and must not be
    /// used afterwards.
    #[inline]
    pub unsafe fn release(&self, ptr: *mut c_void) {
        unsafe { (self.free)(ptr) }
    }

    /// Slot-wise identity. Two tables are the same when every slot points at
    /// the same function.
    ///
    /// Function addresses are not guaranteed unique: one function may get
    /// distinct addresses in different codegen units, and identical bodies
    /// may be merged. A miss only costs the interning one extra table; it
    /// never makes the active table incomplete. Compare tables built from
    /// the same constant or returned by this crate when exactness matters.
    pub fn same_as(&self, other: &Self) -> bool {
        self.addresses() == other.addresses()
    }

    fn addresses(&self) -> [usize; 4] {
        [
            self.malloc as usize,
            self.calloc as usize,
            self.realloc as usize,
            self.free as usize,
        ]
    }
}

impl Default for Allocators {
    fn default() -> Self {
        Self::PLATFORM
    }
}

impl PartialEq for Allocators {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Allocators {}

impl fmt::Debug for Allocators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [malloc, calloc, realloc, free] = self.addresses();
        f.debug_struct("Allocators")
            .field("malloc", &(malloc as *const ()))
            .field("calloc", &(calloc as *const ()))
            .field("realloc", &(realloc as *const ()))
            .field("free", &(free as *const ()))
            .finish()
    }
}

// Aborting wrappers around libc.
unsafe extern "C" fn ts_malloc_aborting(size: usize) -> *mut c_void {
    let result = unsafe { libc::malloc(size) };
    if size > 0 && result.is_null() {
        alloc_failed("allocate", size);
    }
    result
}

unsafe extern "C" fn ts_calloc_aborting(count: usize, size: usize) -> *mut c_void {
    let result = unsafe { libc::calloc(count, size) };
    if count > 0 && size > 0 && result.is_null() {
        alloc_failed("allocate", count.saturating_mul(size));
    }
    result
}

unsafe extern "C" fn ts_realloc_aborting(buffer: *mut c_void, size: usize) -> *mut c_void {
    let result = unsafe { libc::realloc(buffer, size) };
    if size > 0 && result.is_null() {
        alloc_failed("reallocate", size);
    }
    result
}

fn alloc_failed(action: &str, size: usize) -> ! {
    eprintln!("tree-sitter failed to {action} {size} bytes");
    std::process::abort();
}

// ---------------------------------------------------------------------------
// The process-wide table
// ---------------------------------------------------------------------------

#[cfg(feature = "reuse-allocator")]
static PLATFORM_TABLE: Allocators = Allocators::PLATFORM;

/// Always points at an immutable `'static` table, so a reader sees either
/// the previous set or the new one and never a mix of the two.
#[cfg(feature = "reuse-allocator")]
static CURRENT: AtomicPtr<Allocators> =
    AtomicPtr::new(&PLATFORM_TABLE as *const Allocators as *mut Allocators);

/// Every table that has ever been published. Entries are never freed since
/// a reader may still hold a pointer to a replaced table.
#[cfg(feature = "reuse-allocator")]
static INSTALLED: Mutex<Vec<&'static Allocators>> = Mutex::new(Vec::new());

#[cfg(feature = "reuse-allocator")]
fn intern(allocators: Allocators) -> &'static Allocators {
    if PLATFORM_TABLE.same_as(&allocators) {
        return &PLATFORM_TABLE;
    }
    let mut installed = INSTALLED.lock();
    if let Some(existing) = installed.iter().copied().find(|table| table.same_as(&allocators)) {
        return existing;
    }
    let table: &'static Allocators = Box::leak(Box::new(allocators));
    installed.push(table);
    table
}

/// Returns the active table.
#[cfg(feature = "reuse-allocator")]
#[inline]
pub fn current_allocators() -> Allocators {
    // SAFETY: CURRENT only ever holds pointers to 'static tables.
    unsafe { *CURRENT.load(Ordering::Acquire) }
}

/// Replaces all four slots at once and returns the previous table.
///
/// Blocks allocated before the call must still be released through the
/// table that produced them; callers replacing the allocator while such
/// blocks are live are responsible for keeping the pairing straight.
#[cfg(feature = "reuse-allocator")]
pub fn set_allocators(allocators: Allocators) -> Allocators {
    let table = intern(allocators);
    let previous = CURRENT.swap(table as *const Allocators as *mut Allocators, Ordering::AcqRel);
    tracing::debug!(?allocators, "replaced allocator table");
    // SAFETY: see `current_allocators`.
    unsafe { *previous }
}

/// Reinstalls [`Allocators::PLATFORM`].
#[cfg(feature = "reuse-allocator")]
pub fn reset_allocators() -> Allocators {
    let previous = CURRENT.swap(
        &PLATFORM_TABLE as *const Allocators as *mut Allocators,
        Ordering::AcqRel,
    );
    tracing::debug!("reset allocator table to platform defaults");
    // SAFETY: see `current_allocators`.
    unsafe { *previous }
}

/// Installs a table from nullable slots.
///
/// All four present installs them, all four absent resets to the platform
/// defaults, and anything in between is rejected without touching the
/// active table.
#[cfg(feature = "reuse-allocator")]
pub fn try_set_allocator_slots(
    new_malloc: Option<MallocFn>,
    new_calloc: Option<CallocFn>,
    new_realloc: Option<ReallocFn>,
    new_free: Option<FreeFn>,
) -> Result<()> {
    match (new_malloc, new_calloc, new_realloc, new_free) {
        (Some(malloc), Some(calloc), Some(realloc), Some(free)) => {
            set_allocators(Allocators::new(malloc, calloc, realloc, free));
            Ok(())
        }
        (None, None, None, None) => {
            reset_allocators();
            Ok(())
        }
        _ => {
            let present = [
                new_malloc.is_some(),
                new_calloc.is_some(),
                new_realloc.is_some(),
                new_free.is_some(),
            ];
            let missing = AllocatorSlot::ALL
                .into_iter()
                .zip(present)
                .filter_map(|(slot, present)| (!present).then_some(slot))
                .collect();
            Err(AllocatorError::IncompleteTable { missing })
        }
    }
}

/// C entry point for replacing the allocator.
///
/// Passing NULL for every argument restores the defaults. Passing NULL for
/// only some of them is a programming error and aborts the process.
///
/// # Safety
/// Each non-null argument must be a function with libc allocation
/// semantics, and the four must agree on block ownership.
#[cfg(feature = "reuse-allocator")]
#[no_mangle]
pub unsafe extern "C" fn ts_set_allocator(
    new_malloc: Option<MallocFn>,
    new_calloc: Option<CallocFn>,
    new_realloc: Option<ReallocFn>,
    new_free: Option<FreeFn>,
) {
    if let Err(err) = try_set_allocator_slots(new_malloc, new_calloc, new_realloc, new_free) {
        tracing::error!(%err, "rejected ts_set_allocator call");
        eprintln!("tree-sitter: {err}");
        std::process::abort();
    }
}

// ---------------------------------------------------------------------------
// Call-site wrappers
// ---------------------------------------------------------------------------

/// # Safety
/// The result must be released with [`ts_free`].
#[cfg(feature = "reuse-allocator")]
#[inline]
pub unsafe fn ts_malloc(size: usize) -> *mut c_void {
    unsafe { current_allocators().allocate(size) }
}

/// # Safety
/// The result must be released with [`ts_free`].
#[cfg(feature = "reuse-allocator")]
#[inline]
pub unsafe fn ts_calloc(count: usize, size: usize) -> *mut c_void {
    unsafe { current_allocators().zeroed(count, size) }
}

/// # Safety
/// `ptr` must be null or a live block from this module.
#[cfg(feature = "reuse-allocator")]
#[inline]
pub unsafe fn ts_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { current_allocators().reallocate(ptr, size) }
}

/// # Safety
/// `ptr` must be null or a live block from this module.
#[cfg(feature = "reuse-allocator")]
#[inline]
pub unsafe fn ts_free(ptr: *mut c_void) {
    unsafe { current_allocators().release(ptr) }
}

/// # Safety
/// The result must be released with [`ts_free`].
#[cfg(not(feature = "reuse-allocator"))]
#[inline]
pub unsafe fn ts_malloc(size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) }
}

/// # Safety
/// The result must be released with [`ts_free`].
#[cfg(not(feature = "reuse-allocator"))]
#[inline]
pub unsafe fn ts_calloc(count: usize, size: usize) -> *mut c_void {
    unsafe { libc::calloc(count, size) }
}

/// # Safety
/// `ptr` must be null or a live block from this module.
#[cfg(not(feature = "reuse-allocator"))]
#[inline]
pub unsafe fn ts_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { libc::realloc(ptr, size) }
}

/// # Safety
/// `ptr` must be null or a live block from this module.
#[cfg(not(feature = "reuse-allocator"))]
#[inline]
pub unsafe fn ts_free(ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}
