//! Hook registration and the replacement entry bodies.
//!
//! A hook set is a table of nine functions covering the allocation API; each
//! receives the original arguments plus the caller return address. When a
//! table is registered the replacements delegate to it and the hook is
//! responsible for calling the real function; when none is registered the
//! replacements forward directly with minimal overhead. Failure of a hook is
//! visible to the application exactly as failure of the wrapped function
//! would be.

use core::ffi::{c_int, c_void};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::bootstrap;
use super::real::{real, resolving_on_this_thread};

/// The nine hook functions. The trailing `*mut c_void` of each signature is
/// the caller return address of the intercepted call.
#[repr(C)]
pub struct HookTable {
    pub malloc: unsafe extern "C" fn(usize, *mut c_void) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(usize, usize, *mut c_void) -> *mut c_void,
    pub realloc: unsafe extern "C" fn(*mut c_void, usize, *mut c_void) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void, *mut c_void),
    pub posix_memalign: unsafe extern "C" fn(*mut *mut c_void, usize, usize, *mut c_void) -> c_int,
    pub memalign: unsafe extern "C" fn(usize, usize, *mut c_void) -> *mut c_void,
    pub aligned_alloc: unsafe extern "C" fn(usize, usize, *mut c_void) -> *mut c_void,
    pub valloc: unsafe extern "C" fn(usize, *mut c_void) -> *mut c_void,
    pub pvalloc: unsafe extern "C" fn(usize, *mut c_void) -> *mut c_void,
}

static HOOKS: AtomicPtr<HookTable> = AtomicPtr::new(ptr::null_mut());

/// Install `hooks` (or remove the current set with `None`), returning the
/// previously installed set.
pub fn register_hooks(hooks: Option<&'static HookTable>) -> Option<&'static HookTable> {
    let new = match hooks {
        Some(table) => table as *const HookTable as *mut HookTable,
        None => ptr::null_mut(),
    };
    let prev = HOOKS.swap(new, Ordering::AcqRel);
    unsafe { prev.as_ref() }
}

#[inline]
fn hooks() -> Option<&'static HookTable> {
    unsafe { HOOKS.load(Ordering::Acquire).as_ref() }
}

/// The return address of the caller of the enclosing function.
///
/// Reads the return slot of the current frame record, so the enclosing
/// function must be compiled with frame pointers and this helper must be
/// inlined into it (both hold for the preload exports).
#[inline(always)]
pub fn caller_address() -> *mut c_void {
    let ra: *mut c_void;
    unsafe {
        #[cfg(target_arch = "x86_64")]
        core::arch::asm!("mov {}, qword ptr [rbp + 8]", out(reg) ra, options(nostack, readonly));
        #[cfg(target_arch = "aarch64")]
        core::arch::asm!("ldr {}, [x29, #8]", out(reg) ra, options(nostack, readonly));
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            ra = ptr::null_mut();
        }
    }
    ra
}

/// Deregister hooks in a forked child before any user code runs; the
/// child's shard state is a frozen copy the parent still owns.
pub fn install_fork_handler() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe extern "C" fn child() {
        HOOKS.store(ptr::null_mut(), Ordering::SeqCst);
    }
    unsafe {
        libc::pthread_atfork(None, None, Some(child));
    }
}

/// # Safety
/// C `malloc` contract.
pub unsafe fn malloc_entry(size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        return bootstrap::alloc(size);
    }
    match hooks() {
        Some(h) => unsafe { (h.malloc)(size, ra) },
        None => unsafe { (real().malloc)(size) },
    }
}

/// # Safety
/// C `calloc` contract.
pub unsafe fn calloc_entry(nmemb: usize, size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        // The arena is pre-zeroed and never reused.
        return bootstrap::alloc(nmemb.saturating_mul(size));
    }
    match hooks() {
        Some(h) => unsafe { (h.calloc)(nmemb, size, ra) },
        None => unsafe { (real().calloc)(nmemb, size) },
    }
}

/// # Safety
/// C `realloc` contract.
pub unsafe fn realloc_entry(ptr: *mut c_void, size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        return unsafe { bootstrap_realloc(ptr, size) };
    }
    if bootstrap::contains(ptr) {
        // Migrate the block to the real heap; the arena copy stays in place.
        let fresh = unsafe { (real().malloc)(size) };
        if !fresh.is_null() {
            let old = unsafe { bootstrap::usable_size(ptr) };
            unsafe {
                ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, old.min(size));
            }
        }
        return fresh;
    }
    match hooks() {
        Some(h) => unsafe { (h.realloc)(ptr, size, ra) },
        None => unsafe { (real().realloc)(ptr, size) },
    }
}

unsafe fn bootstrap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return bootstrap::alloc(size);
    }
    let old = unsafe { bootstrap::usable_size(ptr) };
    if old >= size {
        return ptr;
    }
    let fresh = bootstrap::alloc(size);
    if !fresh.is_null() {
        unsafe {
            ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, old);
        }
    }
    fresh
}

/// # Safety
/// C `free` contract.
pub unsafe fn free_entry(ptr: *mut c_void, ra: *mut c_void) {
    if ptr.is_null() || bootstrap::contains(ptr) {
        return;
    }
    match hooks() {
        Some(h) => unsafe { (h.free)(ptr, ra) },
        None => unsafe { (real().free)(ptr) },
    }
}

/// # Safety
/// C `posix_memalign` contract.
pub unsafe fn posix_memalign_entry(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
    ra: *mut c_void,
) -> c_int {
    if resolving_on_this_thread() {
        let p = bootstrap::alloc_aligned(align, size);
        if p.is_null() {
            return libc::ENOMEM;
        }
        unsafe {
            *memptr = p;
        }
        return 0;
    }
    match hooks() {
        Some(h) => unsafe { (h.posix_memalign)(memptr, align, size, ra) },
        None => unsafe { (real().posix_memalign)(memptr, align, size) },
    }
}

/// # Safety
/// `memalign(3)` contract.
pub unsafe fn memalign_entry(align: usize, size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        return bootstrap::alloc_aligned(align, size);
    }
    match hooks() {
        Some(h) => unsafe { (h.memalign)(align, size, ra) },
        None => unsafe { (real().memalign)(align, size) },
    }
}

/// # Safety
/// C11 `aligned_alloc` contract (`size % align == 0`).
pub unsafe fn aligned_alloc_entry(align: usize, size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        return bootstrap::alloc_aligned(align, size);
    }
    match hooks() {
        Some(h) => unsafe { (h.aligned_alloc)(align, size, ra) },
        None => unsafe { (real().aligned_alloc)(align, size) },
    }
}

/// # Safety
/// `valloc(3)` contract.
pub unsafe fn valloc_entry(size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        return bootstrap::alloc_aligned(super::real::page_size(), size);
    }
    match hooks() {
        Some(h) => unsafe { (h.valloc)(size, ra) },
        None => unsafe { (real().valloc)(size) },
    }
}

/// # Safety
/// `pvalloc(3)` contract.
pub unsafe fn pvalloc_entry(size: usize, ra: *mut c_void) -> *mut c_void {
    if resolving_on_this_thread() {
        let page = super::real::page_size();
        let rounded = size.div_ceil(page).max(1) * page;
        return bootstrap::alloc_aligned(page, rounded);
    }
    match hooks() {
        Some(h) => unsafe { (h.pvalloc)(size, ra) },
        None => unsafe { (real().pvalloc)(size) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FORWARDED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_malloc(size: usize, _ra: *mut c_void) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().malloc)(size) }
    }
    unsafe extern "C" fn counting_calloc(n: usize, size: usize, _ra: *mut c_void) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().calloc)(n, size) }
    }
    unsafe extern "C" fn counting_realloc(
        ptr: *mut c_void,
        size: usize,
        _ra: *mut c_void,
    ) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().realloc)(ptr, size) }
    }
    unsafe extern "C" fn counting_free(ptr: *mut c_void, _ra: *mut c_void) {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().free)(ptr) }
    }
    unsafe extern "C" fn counting_posix_memalign(
        memptr: *mut *mut c_void,
        align: usize,
        size: usize,
        _ra: *mut c_void,
    ) -> c_int {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().posix_memalign)(memptr, align, size) }
    }
    unsafe extern "C" fn counting_memalign(
        align: usize,
        size: usize,
        _ra: *mut c_void,
    ) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().memalign)(align, size) }
    }
    unsafe extern "C" fn counting_aligned_alloc(
        align: usize,
        size: usize,
        _ra: *mut c_void,
    ) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().aligned_alloc)(align, size) }
    }
    unsafe extern "C" fn counting_valloc(size: usize, _ra: *mut c_void) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().valloc)(size) }
    }
    unsafe extern "C" fn counting_pvalloc(size: usize, _ra: *mut c_void) -> *mut c_void {
        FORWARDED.fetch_add(1, Ordering::SeqCst);
        unsafe { (real().pvalloc)(size) }
    }

    static COUNTING: HookTable = HookTable {
        malloc: counting_malloc,
        calloc: counting_calloc,
        realloc: counting_realloc,
        free: counting_free,
        posix_memalign: counting_posix_memalign,
        memalign: counting_memalign,
        aligned_alloc: counting_aligned_alloc,
        valloc: counting_valloc,
        pvalloc: counting_pvalloc,
    };

    #[test]
    fn trivial_hooks_forward_every_entry_point_once() {
        let _g = crate::test_util::guard();
        let prev = register_hooks(Some(&COUNTING));
        FORWARDED.store(0, Ordering::SeqCst);
        unsafe {
            let p = malloc_entry(1, ptr::null_mut());
            assert!(!p.is_null());
            let p = realloc_entry(p, 12, ptr::null_mut());
            free_entry(p, ptr::null_mut());
            free_entry(ptr::null_mut(), ptr::null_mut());

            let z = calloc_entry(12, 12, ptr::null_mut());
            free_entry(z, ptr::null_mut());

            let mut out: *mut c_void = ptr::null_mut();
            assert_eq!(posix_memalign_entry(&mut out, 1024, 12, ptr::null_mut()), 0);
            free_entry(out, ptr::null_mut());

            let a = memalign_entry(1024, 12, ptr::null_mut());
            free_entry(a, ptr::null_mut());
            let a = aligned_alloc_entry(1024, 1024, ptr::null_mut());
            free_entry(a, ptr::null_mut());
            let a = valloc_entry(12, ptr::null_mut());
            free_entry(a, ptr::null_mut());
            let a = pvalloc_entry(12, ptr::null_mut());
            free_entry(a, ptr::null_mut());
        }
        register_hooks(prev);
        // malloc, realloc, calloc, posix_memalign, memalign, aligned_alloc,
        // valloc, pvalloc and 7 frees; the null free never reaches the hook.
        assert_eq!(FORWARDED.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn registration_returns_previous_set() {
        let _g = crate::test_util::guard();
        let prev = register_hooks(Some(&COUNTING));
        let back = register_hooks(prev);
        assert!(core::ptr::eq(
            back.map_or(ptr::null(), |t| t as *const _),
            &COUNTING as *const _
        ));
    }
}
