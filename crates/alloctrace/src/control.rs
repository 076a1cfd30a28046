//! Control plane: enable, disable, and the process-wide control block.
//!
//! Control words are written only under the global mutex and read with
//! plain atomic loads on the hook path. Readers tolerate stale values; the
//! generation check in the alloc map and the enabled re-check under each
//! shard lock close the windows that matter. The mutex is recursive so an
//! emergency dump can enter from a context that may already hold it.

use core::ffi::{c_int, c_void};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::config::EnableOptions;
use crate::engine::capture::{self, CaptureMethod};
use crate::engine::fingerprint::sampling_params;
use crate::engine::tracker::{self, ENGINE_HOOKS};
use crate::engine::{ALLOC_MAP, MAX_FRAMES, STACK_MAP};
use crate::error::{Error, Result};
use crate::interpose::{self, HookTable, real};

static CONTROL_MUTEX: ReentrantMutex<()> = ReentrantMutex::new(());

static ENABLED: AtomicBool = AtomicBool::new(false);
static LIVE_MODE: AtomicBool = AtomicBool::new(false);
static DETAILED_STATS: AtomicBool = AtomicBool::new(false);
static USE_UNWINDER: AtomicBool = AtomicBool::new(false);
static STACK_DEPTH: AtomicUsize = AtomicUsize::new(12);
static SAMPLING_MASK: AtomicU64 = AtomicU64::new(0);
static SAMPLING_LIMIT: AtomicU64 = AtomicU64::new(1);
static GENERATION: AtomicU64 = AtomicU64::new(0);

static RESERVE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static RESERVE_SIZE: AtomicUsize = AtomicUsize::new(0);
static RAINY_DAY_USED: AtomicBool = AtomicBool::new(false);

pub(crate) fn lock() -> ReentrantMutexGuard<'static, ()> {
    CONTROL_MUTEX.lock()
}

#[inline]
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn live_mode() -> bool {
    LIVE_MODE.load(Ordering::Relaxed)
}

#[inline]
pub fn detailed_stats() -> bool {
    DETAILED_STATS.load(Ordering::Relaxed)
}

#[inline]
pub fn stack_depth() -> usize {
    STACK_DEPTH.load(Ordering::Relaxed)
}

#[inline]
pub fn sampling() -> (u64, u64) {
    (
        SAMPLING_MASK.load(Ordering::Relaxed),
        SAMPLING_LIMIT.load(Ordering::Relaxed),
    )
}

#[inline]
pub fn generation() -> u64 {
    GENERATION.load(Ordering::Relaxed)
}

#[inline]
pub fn capture_method() -> CaptureMethod {
    if USE_UNWINDER.load(Ordering::Relaxed) {
        CaptureMethod::Unwinder
    } else {
        CaptureMethod::FramePointers
    }
}

/// Start a profiling session.
pub fn enable(opts: &EnableOptions) -> Result<()> {
    let _g = lock();
    if enabled() {
        if !opts.force {
            return Err(Error::AlreadyEnabled);
        }
        disable_locked();
    }
    if !(2..=MAX_FRAMES).contains(&opts.stack_depth) {
        return Err(Error::InvalidArgument(format!(
            "stack depth must be in [2, {MAX_FRAMES}], got {}",
            opts.stack_depth
        )));
    }
    if opts.only_nth == 0 {
        return Err(Error::InvalidArgument("only-nth must be >= 1".into()));
    }
    interpose::ensure_resolved()?;

    let method = if opts.use_backtrace && capture::resolve_unwinder() {
        CaptureMethod::Unwinder
    } else {
        if opts.use_backtrace {
            log::warn!("library unwinder unavailable, falling back to frame pointers");
        }
        CaptureMethod::FramePointers
    };

    // In-flight hooks that straddle this transition see a generation
    // mismatch and drop their half-finished updates.
    GENERATION.fetch_add(1, Ordering::SeqCst);

    if !STACK_MAP.init_shards() {
        return Err(Error::ResourceUnavailable(
            "out of memory initializing stack shards".into(),
        ));
    }
    if opts.track_free && !ALLOC_MAP.init_shards() {
        STACK_MAP.teardown_shards();
        return Err(Error::ResourceUnavailable(
            "out of memory initializing alloc shards".into(),
        ));
    }

    let (mask, limit) = sampling_params(opts.only_nth);
    SAMPLING_MASK.store(mask, Ordering::Relaxed);
    SAMPLING_LIMIT.store(limit, Ordering::Relaxed);
    STACK_DEPTH.store(opts.stack_depth, Ordering::Relaxed);
    LIVE_MODE.store(opts.track_free, Ordering::Relaxed);
    DETAILED_STATS.store(opts.detailed_stats, Ordering::Relaxed);
    USE_UNWINDER.store(method == CaptureMethod::Unwinder, Ordering::Relaxed);
    tracker::reset_stats();

    RAINY_DAY_USED.store(false, Ordering::SeqCst);
    if opts.rainy_day_fund > 0 {
        let reserve = unsafe { (real().malloc)(opts.rainy_day_fund) };
        if reserve.is_null() {
            log::warn!(
                "could not preallocate {} reserve bytes",
                opts.rainy_day_fund
            );
        } else {
            RESERVE.store(reserve, Ordering::SeqCst);
            RESERVE_SIZE.store(opts.rainy_day_fund, Ordering::SeqCst);
        }
    }

    capture::prewarm(method);

    GENERATION.fetch_add(1, Ordering::SeqCst);
    ENABLED.store(true, Ordering::SeqCst);
    interpose::install_fork_handler();
    interpose::register_hooks(Some(&ENGINE_HOOKS));

    log::debug!(
        "profiler enabled: depth={} method={:?} only_nth={} live={} stats={}",
        opts.stack_depth,
        method,
        opts.only_nth,
        opts.track_free,
        opts.detailed_stats
    );
    Ok(())
}

/// Stop the profiling session and release all shard memory.
pub fn disable() -> Result<()> {
    let _g = lock();
    if !enabled() {
        return Err(Error::AlreadyDisabled);
    }
    disable_locked();
    log::debug!("profiler disabled");
    Ok(())
}

fn disable_locked() {
    ENABLED.store(false, Ordering::SeqCst);
    interpose::register_hooks(None);
    GENERATION.fetch_add(1, Ordering::SeqCst);
    // Alloc entries borrow stack aggregates; drop the borrowers first.
    ALLOC_MAP.teardown_shards();
    STACK_MAP.teardown_shards();
    release_reserve();
}

/// One-shot claim of the emergency path. The first claimant frees the
/// reserve so the reporter has heap headroom.
pub(crate) fn claim_rainy_day() -> bool {
    if RAINY_DAY_USED.swap(true, Ordering::SeqCst) {
        return false;
    }
    release_reserve();
    true
}

pub(crate) fn release_reserve() {
    let reserve = RESERVE.swap(ptr::null_mut(), Ordering::SeqCst);
    if !reserve.is_null() {
        RESERVE_SIZE.store(0, Ordering::SeqCst);
        unsafe {
            (real().free)(reserve);
        }
    }
}

pub(crate) fn reserve_size() -> usize {
    RESERVE_SIZE.load(Ordering::SeqCst)
}

// During an emergency dump every other thread's allocation parks on the
// control mutex until the reporter is done; the reporter itself re-enters
// freely because the mutex is recursive.

unsafe extern "C" fn blocking_malloc(size: usize, _ra: *mut c_void) -> *mut c_void {
    let _g = lock();
    unsafe { (real().malloc)(size) }
}

unsafe extern "C" fn blocking_calloc(nmemb: usize, size: usize, _ra: *mut c_void) -> *mut c_void {
    let _g = lock();
    unsafe { (real().calloc)(nmemb, size) }
}

unsafe extern "C" fn blocking_realloc(
    ptr: *mut c_void,
    size: usize,
    _ra: *mut c_void,
) -> *mut c_void {
    let _g = lock();
    unsafe { (real().realloc)(ptr, size) }
}

unsafe extern "C" fn blocking_free(ptr: *mut c_void, _ra: *mut c_void) {
    let _g = lock();
    unsafe { (real().free)(ptr) }
}

unsafe extern "C" fn blocking_posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
    _ra: *mut c_void,
) -> c_int {
    let _g = lock();
    unsafe { (real().posix_memalign)(memptr, align, size) }
}

unsafe extern "C" fn blocking_memalign(align: usize, size: usize, _ra: *mut c_void) -> *mut c_void {
    let _g = lock();
    unsafe { (real().memalign)(align, size) }
}

unsafe extern "C" fn blocking_aligned_alloc(
    align: usize,
    size: usize,
    _ra: *mut c_void,
) -> *mut c_void {
    let _g = lock();
    unsafe { (real().aligned_alloc)(align, size) }
}

unsafe extern "C" fn blocking_valloc(size: usize, _ra: *mut c_void) -> *mut c_void {
    let _g = lock();
    unsafe { (real().valloc)(size) }
}

unsafe extern "C" fn blocking_pvalloc(size: usize, _ra: *mut c_void) -> *mut c_void {
    let _g = lock();
    unsafe { (real().pvalloc)(size) }
}

pub(crate) static BLOCKING_HOOKS: HookTable = HookTable {
    malloc: blocking_malloc,
    calloc: blocking_calloc,
    realloc: blocking_realloc,
    free: blocking_free,
    posix_memalign: blocking_posix_memalign,
    memalign: blocking_memalign,
    aligned_alloc: blocking_aligned_alloc,
    valloc: blocking_valloc,
    pvalloc: blocking_pvalloc,
};

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn force_enabled(v: bool) {
        ENABLED.store(v, Ordering::SeqCst);
    }

    pub fn force_live_mode(v: bool) {
        LIVE_MODE.store(v, Ordering::SeqCst);
    }
}
