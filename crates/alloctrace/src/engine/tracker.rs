//! Hook dispatcher: the engine's hook set.
//!
//! Every hook calls the real function first and then records best-effort.
//! Nothing on this path may fail visibly; when a shard has no memory the
//! update is dropped and the host sees exactly what the real allocator
//! returned.

use core::cell::Cell;
use core::ffi::{c_int, c_void};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::allocmap::ALLOC_MAP;
use super::capture::capture;
use super::fingerprint::{fingerprint, is_tracked, stack_hash};
use super::stackmap::{STACK_MAP, StackAgg};
use super::MAX_FRAMES;
use crate::control;
use crate::interpose::{self, HookTable, real};

/// Frames belonging to the dispatcher itself, dropped from each capture.
const SKIP_FRAMES: usize = 3;

thread_local! {
    static SUSPENDED: Cell<bool> = const { Cell::new(false) };
}

// Reading a thread-local costs more than a relaxed load; this flag skips
// the read entirely until suspension is first used.
static SUSPEND_IN_USE: AtomicBool = AtomicBool::new(false);

static TRACKED: AtomicU64 = AtomicU64::new(0);
static UNTRACKED: AtomicU64 = AtomicU64::new(0);
static FAILED_FREES: AtomicU64 = AtomicU64::new(0);

/// Suspend tracking on the current thread for the guard's lifetime. The
/// reporter wraps itself in this so its own allocations stay invisible.
pub fn suspend_tracking() -> SuspendGuard {
    SUSPEND_IN_USE.store(true, Ordering::Relaxed);
    SuspendGuard {
        prev: SUSPENDED.replace(true),
    }
}

pub struct SuspendGuard {
    prev: bool,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        SUSPENDED.set(self.prev);
    }
}

#[inline]
fn suspended() -> bool {
    SUSPEND_IN_USE.load(Ordering::Relaxed) && SUSPENDED.get()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackStats {
    pub tracked: u64,
    pub untracked: u64,
    pub failed_frees: u64,
}

pub fn stats() -> TrackStats {
    TrackStats {
        tracked: TRACKED.load(Ordering::Relaxed),
        untracked: UNTRACKED.load(Ordering::Relaxed),
        failed_frees: FAILED_FREES.load(Ordering::Relaxed),
    }
}

pub fn reset_stats() {
    TRACKED.store(0, Ordering::Relaxed);
    UNTRACKED.store(0, Ordering::Relaxed);
    FAILED_FREES.store(0, Ordering::Relaxed);
    super::capture::CAPTURE_COUNT.store(0, Ordering::Relaxed);
    super::capture::CAPTURE_NANOS.store(0, Ordering::Relaxed);
}

/// Attribute one allocation to its call stack. `requested` is what the
/// caller asked for; live mode credits the allocator's usable size instead
/// so the later debit can reproduce it from the bare pointer.
fn record_allocation(ptr: *mut c_void, requested: usize, entry_fn: usize, ra: *mut c_void) {
    if ptr.is_null() || !control::enabled() || suspended() {
        return;
    }
    let live = control::live_mode();
    let (mask, limit) = control::sampling();

    let live_fp = if mask == 0 && !live {
        None
    } else {
        let fp = fingerprint(ptr as usize);
        if !is_tracked(fp, mask, limit) {
            UNTRACKED.fetch_add(1, Ordering::Relaxed);
            return;
        }
        live.then_some(fp)
    };

    let credit = if live {
        unsafe { (real().malloc_usable_size)(ptr) as u64 }
    } else {
        requested as u64
    };

    let generation = control::generation();
    let mut frames = [0usize; MAX_FRAMES];
    let want = (control::stack_depth() + SKIP_FRAMES).min(MAX_FRAMES);
    let n = capture(control::capture_method(), &mut frames, want);

    // Whatever the unwinder managed, the intercepted API and its caller
    // must never be lost.
    let synth = [entry_fn, ra as usize];
    let stack = if n >= SKIP_FRAMES + 2 {
        &frames[SKIP_FRAMES..n]
    } else {
        &synth[..]
    };

    let agg = STACK_MAP.credit(stack_hash(stack), stack, credit);
    if agg.is_null() {
        UNTRACKED.fetch_add(1, Ordering::Relaxed);
        return;
    }
    TRACKED.fetch_add(1, Ordering::Relaxed);
    if let Some(fp) = live_fp {
        ALLOC_MAP.insert(fp, agg, generation);
    }
}

/// Debit the stack aggregate owning `ptr` and drop its alloc-map entry.
/// Runs before the real free while the pointer is still live.
fn record_free(ptr: *mut c_void) {
    if ptr.is_null() || !control::enabled() || !control::live_mode() || suspended() {
        return;
    }
    let (mask, limit) = control::sampling();
    let fp = fingerprint(ptr as usize);
    if !is_tracked(fp, mask, limit) {
        return;
    }
    let agg = ALLOC_MAP.remove(fp);
    if agg.is_null() {
        // Allocated before enabling, or lost to a shard allocation failure.
        FAILED_FREES.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let size = unsafe { (real().malloc_usable_size)(ptr) as u64 };
    unsafe {
        STACK_MAP.debit(agg, size);
    }
}

pub unsafe extern "C" fn malloc_hook(size: usize, ra: *mut c_void) -> *mut c_void {
    let ptr = unsafe { (real().malloc)(size) };
    record_allocation(ptr, size, interpose::malloc_entry as usize, ra);
    ptr
}

pub unsafe extern "C" fn calloc_hook(nmemb: usize, size: usize, ra: *mut c_void) -> *mut c_void {
    let ptr = unsafe { (real().calloc)(nmemb, size) };
    record_allocation(ptr, nmemb.saturating_mul(size), interpose::calloc_entry as usize, ra);
    ptr
}

pub unsafe extern "C" fn realloc_hook(
    ptr: *mut c_void,
    new_size: usize,
    ra: *mut c_void,
) -> *mut c_void {
    let live = control::enabled() && control::live_mode() && !suspended();
    let mut debited: *mut StackAgg = ptr::null_mut();
    let mut debited_size = 0u64;
    let mut old_fp = 0u64;

    // Debit speculatively: once the real resize runs, the old pointer may
    // be reissued to another thread, and its usable size is gone.
    if live && !ptr.is_null() {
        let (mask, limit) = control::sampling();
        old_fp = fingerprint(ptr as usize);
        if is_tracked(old_fp, mask, limit) {
            debited = ALLOC_MAP.remove(old_fp);
            if debited.is_null() {
                FAILED_FREES.fetch_add(1, Ordering::Relaxed);
            } else {
                debited_size = unsafe { (real().malloc_usable_size)(ptr) as u64 };
                unsafe {
                    STACK_MAP.debit(debited, debited_size);
                }
            }
        }
    }

    let result = unsafe { (real().realloc)(ptr, new_size) };

    if result.is_null() {
        if new_size > 0 && !debited.is_null() {
            // The failed resize left the old block alive; restore it.
            unsafe {
                STACK_MAP.recredit(debited, debited_size);
            }
            ALLOC_MAP.insert(old_fp, debited, control::generation());
        }
        return result;
    }
    if new_size == 0 {
        return result;
    }
    record_allocation(result, new_size, interpose::realloc_entry as usize, ra);
    result
}

pub unsafe extern "C" fn free_hook(ptr: *mut c_void, _ra: *mut c_void) {
    record_free(ptr);
    unsafe {
        (real().free)(ptr);
    }
}

pub unsafe extern "C" fn posix_memalign_hook(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
    ra: *mut c_void,
) -> c_int {
    let rc = unsafe { (real().posix_memalign)(memptr, align, size) };
    if rc == 0 {
        record_allocation(
            unsafe { *memptr },
            size,
            interpose::posix_memalign_entry as usize,
            ra,
        );
    }
    rc
}

pub unsafe extern "C" fn memalign_hook(align: usize, size: usize, ra: *mut c_void) -> *mut c_void {
    let ptr = unsafe { (real().memalign)(align, size) };
    record_allocation(ptr, size, interpose::memalign_entry as usize, ra);
    ptr
}

pub unsafe extern "C" fn aligned_alloc_hook(
    align: usize,
    size: usize,
    ra: *mut c_void,
) -> *mut c_void {
    let ptr = unsafe { (real().aligned_alloc)(align, size) };
    record_allocation(ptr, size, interpose::aligned_alloc_entry as usize, ra);
    ptr
}

pub unsafe extern "C" fn valloc_hook(size: usize, ra: *mut c_void) -> *mut c_void {
    let ptr = unsafe { (real().valloc)(size) };
    record_allocation(ptr, size, interpose::valloc_entry as usize, ra);
    ptr
}

pub unsafe extern "C" fn pvalloc_hook(size: usize, ra: *mut c_void) -> *mut c_void {
    let ptr = unsafe { (real().pvalloc)(size) };
    let page = interpose::page_size();
    let rounded = size.div_ceil(page).max(1) * page;
    record_allocation(ptr, rounded, interpose::pvalloc_entry as usize, ra);
    ptr
}

/// The engine's hook set, registered by `enable`.
pub static ENGINE_HOOKS: HookTable = HookTable {
    malloc: malloc_hook,
    calloc: calloc_hook,
    realloc: realloc_hook,
    free: free_hook,
    posix_memalign: posix_memalign_hook,
    memalign: memalign_hook,
    aligned_alloc: aligned_alloc_hook,
    valloc: valloc_hook,
    pvalloc: pvalloc_hook,
};
