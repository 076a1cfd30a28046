//! Resolution of the real allocator implementations.
//!
//! Lookup prefers `dlsym(RTLD_NEXT, name)` so the shim composes with other
//! preloaded libraries; glibc-internal `__libc_*` aliases are the fallback.
//! The optional page-oriented entry points are synthesized from `memalign`
//! on platforms whose libc does not export them.

use core::ffi::{c_char, c_int, c_void};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
pub type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type AlignedAllocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type VallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type PvallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type MallocUsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// The table of real allocation implementations.
///
/// `malloc_usable_size` may over-estimate but is stable for a given pointer;
/// it is what live mode credits and debits so the two always agree.
pub struct RealFuncs {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
    pub posix_memalign: PosixMemalignFn,
    pub memalign: MemalignFn,
    pub aligned_alloc: AlignedAllocFn,
    pub valloc: VallocFn,
    pub pvalloc: PvallocFn,
    pub malloc_usable_size: MallocUsableSizeFn,
}

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

struct RealCell(core::cell::UnsafeCell<core::mem::MaybeUninit<RealFuncs>>);

unsafe impl Sync for RealCell {}

static REAL: RealCell = RealCell(core::cell::UnsafeCell::new(core::mem::MaybeUninit::uninit()));
static STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static RESOLVING_THREAD: AtomicUsize = AtomicUsize::new(0);

fn self_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// True while the current thread is inside symbol resolution. Allocation
/// calls issued by the dynamic linker on this thread land in the bootstrap
/// arena instead of recursing into `real()`.
pub(super) fn resolving_on_this_thread() -> bool {
    STATE.load(Ordering::Acquire) == RESOLVING
        && RESOLVING_THREAD.load(Ordering::Relaxed) == self_thread()
}

/// The real allocation implementations, resolving them on first use.
///
/// A C `malloc` replacement has no error channel; if the real allocator
/// cannot be found the process cannot continue.
pub fn real() -> &'static RealFuncs {
    match resolve_state() {
        READY => unsafe { (*REAL.0.get()).assume_init_ref() },
        _ => die("alloctrace: real allocator symbols unavailable\n"),
    }
}

/// Resolve eagerly, reporting failure to the operator path instead of
/// aborting. Used by `enable` so a missing symbol produces a diagnostic.
pub fn ensure_resolved() -> crate::Result<()> {
    if resolve_state() == READY {
        Ok(())
    } else {
        Err(crate::Error::ResourceUnavailable(
            "real allocator symbols could not be resolved".into(),
        ))
    }
}

/// Drive resolution to a terminal state and return it (READY or FAILED).
fn resolve_state() -> u8 {
    loop {
        match STATE.load(Ordering::Acquire) {
            state @ (READY | FAILED) => return state,
            _ => {}
        }
        match STATE.compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(READY) => return READY,
            Err(FAILED) => return FAILED,
            // Another thread is mid-resolution; wait for it to finish.
            Err(_) => core::hint::spin_loop(),
        }
    }
    RESOLVING_THREAD.store(self_thread(), Ordering::Relaxed);
    let resolved = RealFuncs::resolve();
    let state = match resolved {
        Some(funcs) => {
            unsafe {
                (*REAL.0.get()).write(funcs);
            }
            READY
        }
        None => FAILED,
    };
    RESOLVING_THREAD.store(0, Ordering::Relaxed);
    STATE.store(state, Ordering::Release);
    state
}

fn die(msg: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const c_void, msg.len());
        libc::abort();
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn lookup(name: &'static core::ffi::CStr) -> *mut c_void {
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) }
}

fn lookup_with_alias(
    name: &'static core::ffi::CStr,
    alias: Option<&'static core::ffi::CStr>,
) -> *mut c_void {
    let sym = lookup(name);
    if !sym.is_null() {
        return sym;
    }
    match alias {
        Some(alias) => lookup(alias),
        None => core::ptr::null_mut(),
    }
}

unsafe extern "C" fn valloc_via_memalign(size: usize) -> *mut c_void {
    unsafe { (real().memalign)(page_size(), size) }
}

unsafe extern "C" fn pvalloc_via_memalign(size: usize) -> *mut c_void {
    let page = page_size();
    let rounded = size.div_ceil(page).max(1) * page;
    unsafe { (real().memalign)(page, rounded) }
}

unsafe extern "C" fn aligned_alloc_via_memalign(align: usize, size: usize) -> *mut c_void {
    unsafe { (real().memalign)(align, size) }
}

impl RealFuncs {
    /// Resolve the full table. `dlsym` may allocate; those nested calls are
    /// served by the bootstrap arena because [`resolving_on_this_thread`] is
    /// true for the duration.
    fn resolve() -> Option<RealFuncs> {
        unsafe {
            let malloc = lookup_with_alias(c"malloc", Some(c"__libc_malloc"));
            let calloc = lookup_with_alias(c"calloc", Some(c"__libc_calloc"));
            let realloc = lookup_with_alias(c"realloc", Some(c"__libc_realloc"));
            let free = lookup_with_alias(c"free", Some(c"__libc_free"));
            let memalign = lookup_with_alias(c"memalign", Some(c"__libc_memalign"));
            let posix_memalign = lookup_with_alias(c"posix_memalign", None);
            let aligned_alloc = lookup_with_alias(c"aligned_alloc", None);
            let valloc = lookup_with_alias(c"valloc", Some(c"__libc_valloc"));
            let pvalloc = lookup_with_alias(c"pvalloc", Some(c"__libc_pvalloc"));
            let musable = lookup_with_alias(c"malloc_usable_size", None);

            if malloc.is_null()
                || calloc.is_null()
                || realloc.is_null()
                || free.is_null()
                || memalign.is_null()
                || posix_memalign.is_null()
                || musable.is_null()
            {
                return None;
            }

            Some(RealFuncs {
                malloc: core::mem::transmute::<*mut c_void, MallocFn>(malloc),
                calloc: core::mem::transmute::<*mut c_void, CallocFn>(calloc),
                realloc: core::mem::transmute::<*mut c_void, ReallocFn>(realloc),
                free: core::mem::transmute::<*mut c_void, FreeFn>(free),
                posix_memalign: core::mem::transmute::<*mut c_void, PosixMemalignFn>(
                    posix_memalign,
                ),
                memalign: core::mem::transmute::<*mut c_void, MemalignFn>(memalign),
                aligned_alloc: if aligned_alloc.is_null() {
                    aligned_alloc_via_memalign
                } else {
                    core::mem::transmute::<*mut c_void, AlignedAllocFn>(aligned_alloc)
                },
                valloc: if valloc.is_null() {
                    valloc_via_memalign
                } else {
                    core::mem::transmute::<*mut c_void, VallocFn>(valloc)
                },
                pvalloc: if pvalloc.is_null() {
                    pvalloc_via_memalign
                } else {
                    core::mem::transmute::<*mut c_void, PvallocFn>(pvalloc)
                },
                malloc_usable_size: core::mem::transmute::<*mut c_void, MallocUsableSizeFn>(
                    musable,
                ),
            })
        }
    }
}
