//! LD_PRELOAD shim for alloctrace.
//!
//! Exports replacements for the C allocation entry points and wires the
//! startup driver to the `ALLOCTRACE_OPTS` environment variable. All logic
//! lives in the `alloctrace` crate; each export only captures its caller's
//! return address and forwards.
//!
//! ```bash
//! LD_PRELOAD=liballoctrace_preload.so \
//! ALLOCTRACE_OPTS="enable,track-free,dump-interval=1m,dump-output=/tmp/at.@pid" \
//! ./host_program
//! ```
//!
//! Set `ALLOCTRACE_LOG=debug` for driver diagnostics on stderr.

use core::ffi::{c_int, c_void};

use alloctrace::interpose::{self, caller_address};

/// # Safety
/// C `malloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::malloc_entry(size, ra) }
}

/// # Safety
/// C `calloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::calloc_entry(nmemb, size, ra) }
}

/// # Safety
/// C `realloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::realloc_entry(ptr, size, ra) }
}

/// # Safety
/// C `free` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let ra = caller_address();
    unsafe { interpose::free_entry(ptr, ra) }
}

/// # Safety
/// C `posix_memalign` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    let ra = caller_address();
    unsafe { interpose::posix_memalign_entry(memptr, align, size, ra) }
}

/// # Safety
/// `memalign(3)` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::memalign_entry(align, size, ra) }
}

/// # Safety
/// C11 `aligned_alloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::aligned_alloc_entry(align, size, ra) }
}

/// # Safety
/// `valloc(3)` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::valloc_entry(size, ra) }
}

/// # Safety
/// `pvalloc(3)` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let ra = caller_address();
    unsafe { interpose::pvalloc_entry(size, ra) }
}

/// Emergency dump entry point for the host's fatal-error handler. Safe to
/// call repeatedly; only the first call dumps.
#[unsafe(no_mangle)]
pub extern "C" fn alloctrace_emergency_dump() {
    alloctrace::startup::emergency_dump();
}

extern "C" fn initialize() {
    interpose::install_fork_handler();
    if std::env::var_os("ALLOCTRACE_LOG").is_some() {
        let _ = env_logger::Builder::from_env(env_logger::Env::new().filter("ALLOCTRACE_LOG"))
            .try_init();
    }
    alloctrace::startup::init_from_env();
}

#[used]
#[unsafe(link_section = ".init_array")]
static INIT: extern "C" fn() = initialize;
