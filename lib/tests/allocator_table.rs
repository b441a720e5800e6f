#![cfg(feature = "reuse-allocator")]

use std::ffi::c_void;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tree_sitter_alloc::{
    current_allocators, reset_allocators, set_allocators, tracking, try_set_allocator_slots,
    ts_calloc, ts_free, ts_malloc, ts_realloc, ts_set_allocator, AllocatorError, AllocatorSlot,
    Allocators,
};

// Every test here replaces the process-wide table.
static TABLE_LOCK: Mutex<()> = Mutex::new(());

static MALLOC_CALLS: AtomicUsize = AtomicUsize::new(0);
static CALLOC_CALLS: AtomicUsize = AtomicUsize::new(0);
static REALLOC_CALLS: AtomicUsize = AtomicUsize::new(0);
static FREE_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counting_malloc(size: usize) -> *mut c_void {
    MALLOC_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { libc::malloc(size) }
}

unsafe extern "C" fn counting_calloc(count: usize, size: usize) -> *mut c_void {
    CALLOC_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { libc::calloc(count, size) }
}

unsafe extern "C" fn counting_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    REALLOC_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { libc::realloc(ptr, size) }
}

unsafe extern "C" fn counting_free(ptr: *mut c_void) {
    FREE_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { libc::free(ptr) }
}

const COUNTING: Allocators =
    Allocators::new(counting_malloc, counting_calloc, counting_realloc, counting_free);

fn counts() -> [usize; 4] {
    [
        MALLOC_CALLS.load(Ordering::SeqCst),
        CALLOC_CALLS.load(Ordering::SeqCst),
        REALLOC_CALLS.load(Ordering::SeqCst),
        FREE_CALLS.load(Ordering::SeqCst),
    ]
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn platform_defaults_are_active_at_startup() {
    let _guard = TABLE_LOCK.lock();
    reset_allocators();
    assert_eq!(current_allocators(), Allocators::PLATFORM);

    unsafe {
        let block = ts_malloc(48) as *mut u8;
        assert!(!block.is_null());
        block.write_bytes(1, 48);

        let zeroed = ts_calloc(6, 8) as *mut u8;
        assert!(!zeroed.is_null());
        assert!(std::slice::from_raw_parts(zeroed, 48).iter().all(|b| *b == 0));

        let grown = ts_realloc(block.cast(), 4096) as *mut u8;
        assert!(!grown.is_null());
        assert!(std::slice::from_raw_parts(grown, 48).iter().all(|b| *b == 1));

        // Same failure behavior as calling libc directly.
        assert!(ts_calloc(usize::MAX, 2).is_null());
        assert!(libc::calloc(usize::MAX, 2).is_null());

        ts_free(grown.cast());
        ts_free(zeroed.cast());
        ts_free(std::ptr::null_mut());
    }
}

#[test]
fn replaced_table_receives_every_call() {
    let _guard = TABLE_LOCK.lock();
    init_tracing();
    let previous = set_allocators(COUNTING);
    assert_eq!(current_allocators(), COUNTING);

    let before = counts();
    unsafe {
        let block = ts_malloc(16);
        let zeroed = ts_calloc(2, 16);
        let grown = ts_realloc(block, 256);
        ts_free(grown);
        ts_free(zeroed);
    }
    let after = counts();
    assert_eq!(after[0], before[0] + 1);
    assert_eq!(after[1], before[1] + 1);
    assert_eq!(after[2], before[2] + 1);
    assert_eq!(after[3], before[3] + 2);

    assert_eq!(set_allocators(previous), COUNTING);
    let restored = counts();
    unsafe { ts_free(ts_malloc(8)) };
    assert_eq!(counts(), restored);
}

#[test]
fn readers_never_observe_a_mixed_table() {
    let _guard = TABLE_LOCK.lock();
    reset_allocators();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut observed = 0usize;
                while !done.load(Ordering::Relaxed) {
                    let table = current_allocators();
                    assert!(
                        table == Allocators::PLATFORM || table == COUNTING,
                        "observed a torn table: {table:?}"
                    );
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    for round in 0..20_000 {
        if round % 2 == 0 {
            set_allocators(COUNTING);
        } else {
            reset_allocators();
        }
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    reset_allocators();
}

#[test]
fn set_allocators_returns_the_previous_table() {
    let _guard = TABLE_LOCK.lock();
    reset_allocators();
    assert_eq!(set_allocators(Allocators::ABORTING), Allocators::PLATFORM);
    assert_eq!(set_allocators(COUNTING), Allocators::ABORTING);
    assert_eq!(reset_allocators(), COUNTING);
}

#[test]
fn nullable_slots_must_be_complete() {
    let _guard = TABLE_LOCK.lock();
    init_tracing();
    set_allocators(COUNTING);

    let err = try_set_allocator_slots(Some(libc::malloc), None, Some(libc::realloc), None)
        .unwrap_err();
    assert_eq!(
        err,
        AllocatorError::IncompleteTable {
            missing: vec![AllocatorSlot::Calloc, AllocatorSlot::Free],
        }
    );
    assert_eq!(current_allocators(), COUNTING);

    try_set_allocator_slots(None, None, None, None).unwrap();
    assert_eq!(current_allocators(), Allocators::PLATFORM);

    try_set_allocator_slots(
        Some(counting_malloc),
        Some(counting_calloc),
        Some(counting_realloc),
        Some(counting_free),
    )
    .unwrap();
    assert_eq!(current_allocators(), COUNTING);
    reset_allocators();
}

#[test]
fn tracking_table_flags_double_release() {
    let _guard = TABLE_LOCK.lock();
    init_tracing();
    set_allocators(tracking::allocators());

    unsafe {
        let first = ts_malloc(32);
        let second = ts_malloc(32);
        assert!(tracking::is_live(first));

        ts_free(first);
        let before = tracking::stats();
        ts_free(first);
        let after = tracking::stats();
        assert_eq!(after.misuses, before.misuses + 1);

        // The unrelated block is untouched by the bad release.
        assert!(tracking::is_live(second));
        (second as *mut u8).write_bytes(9, 32);
        ts_free(second);
        assert!(!tracking::is_live(second));
    }
    reset_allocators();
}

#[test]
fn c_entry_point_installs_and_resets() {
    let _guard = TABLE_LOCK.lock();
    init_tracing();
    reset_allocators();

    unsafe {
        ts_set_allocator(
            Some(counting_malloc),
            Some(counting_calloc),
            Some(counting_realloc),
            Some(counting_free),
        );
    }
    assert_eq!(current_allocators(), COUNTING);

    let before = counts();
    unsafe { ts_free(ts_malloc(24)) };
    let after = counts();
    assert_eq!(after[0], before[0] + 1);
    assert_eq!(after[3], before[3] + 1);

    unsafe { ts_set_allocator(None, None, None, None) };
    assert_eq!(current_allocators(), Allocators::PLATFORM);
}

const PARTIAL_TABLE_CHILD: &str = "TREE_SITTER_ALLOC_PARTIAL_TABLE_CHILD";

// Runs in a child process: a partial table through the C entry point
// aborts, which would take the whole test binary down.
#[test]
fn c_entry_point_aborts_on_partial_table() {
    if std::env::var_os(PARTIAL_TABLE_CHILD).is_some() {
        unsafe { ts_set_allocator(Some(libc::malloc), None, None, Some(libc::free)) };
        unreachable!("ts_set_allocator accepted a partial table");
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "c_entry_point_aborts_on_partial_table",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(PARTIAL_TABLE_CHILD, "1")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("allocator table is missing the calloc, realloc slot(s)"),
        "unexpected stderr: {stderr}"
    );
}
