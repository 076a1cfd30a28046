//! Call-stack capture.
//!
//! Two methods, chosen at enable time: the C library unwinder
//! (`backtrace(3)`, resolved dynamically so platforms without it degrade
//! gracefully) and a frame-pointer walker. The walker reads saved frame
//! records directly; SIGSEGV is unblocked for the duration because a torn
//! frame chain may point anywhere.

use core::ffi::{c_int, c_void};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};

use super::MAX_FRAMES;
use crate::control;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CaptureMethod {
    /// `backtrace(3)` from the C library.
    Unwinder,
    /// Walk the chain of saved frame pointers.
    FramePointers,
}

type BacktraceFn = unsafe extern "C" fn(*mut *mut c_void, c_int) -> c_int;

static BACKTRACE_FN: AtomicUsize = AtomicUsize::new(0);

/// Total captures and nanoseconds spent capturing, kept when detailed
/// stats are enabled.
pub static CAPTURE_COUNT: AtomicU64 = AtomicU64::new(0);
pub static CAPTURE_NANOS: AtomicU64 = AtomicU64::new(0);

/// Locate the library unwinder. Returns false when the platform has none,
/// in which case enable falls back to frame pointers.
pub fn resolve_unwinder() -> bool {
    if BACKTRACE_FN.load(Ordering::Acquire) != 0 {
        return true;
    }
    let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"backtrace".as_ptr()) };
    if sym.is_null() {
        return false;
    }
    BACKTRACE_FN.store(sym as usize, Ordering::Release);
    true
}

/// Some unwinders allocate internally on first use; capturing once at
/// enable time keeps that allocation out of the first hooked call.
pub fn prewarm(method: CaptureMethod) {
    let mut buf = [0usize; MAX_FRAMES];
    let _ = capture(method, &mut buf, MAX_FRAMES);
}

/// Capture up to `depth` return addresses into `buf`, newest first.
#[inline(never)]
pub fn capture(method: CaptureMethod, buf: &mut [usize; MAX_FRAMES], depth: usize) -> usize {
    let depth = depth.min(MAX_FRAMES);
    let timed = control::detailed_stats();
    let started = timed.then(Instant::now);

    let n = match method {
        CaptureMethod::Unwinder => capture_unwinder(buf, depth),
        CaptureMethod::FramePointers => with_segv_unblocked(|| walk_frame_pointers(buf, depth)),
    };

    if let Some(started) = started {
        CAPTURE_COUNT.fetch_add(1, Ordering::Relaxed);
        CAPTURE_NANOS.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
    n
}

fn capture_unwinder(buf: &mut [usize; MAX_FRAMES], depth: usize) -> usize {
    let raw = BACKTRACE_FN.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let backtrace: BacktraceFn = unsafe { core::mem::transmute(raw) };
    let n = unsafe { backtrace(buf.as_mut_ptr() as *mut *mut c_void, depth as c_int) };
    n.max(0) as usize
}

fn with_segv_unblocked<R>(f: impl FnOnce() -> R) -> R {
    let mut segv = SigSet::empty();
    segv.add(Signal::SIGSEGV);
    let mut old = SigSet::empty();
    let unblocked =
        signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&segv), Some(&mut old)).is_ok();
    let result = f();
    if unblocked {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
    }
    result
}

/// Saved frame record at the head of each frame: the caller's frame
/// pointer, then the return address (x86-64 and AArch64 psABI layout).
#[repr(C)]
struct FrameRecord {
    prev: usize,
    ret: usize,
}

#[inline(always)]
fn entry_frame() -> usize {
    let fp: usize;
    unsafe {
        #[cfg(target_arch = "x86_64")]
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        #[cfg(target_arch = "aarch64")]
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            fp = 0;
        }
    }
    fp
}

/// Walk the chain of saved frame records.
///
/// The scan window is anchored at this function's own frame: stacks grow
/// down, so every caller record lies at a higher address, and the window
/// ceiling bounds the walk on threads whose stack limits we never asked
/// the runtime for. Before trusting the chain at all, the entry frame
/// pointer must land within a frame-sized distance of a known stack local;
/// a build without frame pointers leaves a reused register there and fails
/// that test immediately. A record whose return address points back into
/// the window belongs to a JIT blob or the outermost C frame and ends the
/// walk, as does any link that does not move strictly upward.
#[inline(never)]
fn walk_frame_pointers(buf: &mut [usize; MAX_FRAMES], depth: usize) -> usize {
    const SCAN_WINDOW: usize = 8 << 20;
    const FRAME_SLACK: usize = 64 << 10;

    let marker = 0u8;
    let anchor = &raw const marker as usize;

    let low = entry_frame();
    if low == 0 || low % align_of::<FrameRecord>() != 0 || low.abs_diff(anchor) > FRAME_SLACK {
        return 0;
    }
    let high = low.saturating_add(SCAN_WINDOW);

    let mut fp = low;
    let mut count = 0usize;
    while count < depth {
        let record = unsafe { &*(fp as *const FrameRecord) };
        if record.ret == 0 || (low..high).contains(&record.ret) {
            break;
        }
        buf[count] = record.ret;
        count += 1;

        let next = record.prev;
        if next <= fp || next >= high || next % align_of::<FrameRecord>() != 0 {
            break;
        }
        fp = next;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinder_resolves_and_captures_this_test() {
        if !resolve_unwinder() {
            return;
        }
        let mut buf = [0usize; MAX_FRAMES];
        let n = capture(CaptureMethod::Unwinder, &mut buf, MAX_FRAMES);
        assert!(n >= 2, "got {n} frames");
        assert!(buf[..n].iter().all(|&f| f != 0));
    }

    #[test]
    fn depth_limit_is_honored() {
        if !resolve_unwinder() {
            return;
        }
        let mut buf = [0usize; MAX_FRAMES];
        let n = capture(CaptureMethod::Unwinder, &mut buf, 3);
        assert!(n <= 3);
    }

    #[test]
    fn frame_pointer_walk_stays_in_bounds() {
        // Frame pointers may be omitted in test builds; the walk must still
        // terminate and report only what it validated.
        let mut buf = [0usize; MAX_FRAMES];
        let n = capture(CaptureMethod::FramePointers, &mut buf, MAX_FRAMES);
        assert!(n <= MAX_FRAMES);
        assert!(buf[..n].iter().all(|&f| f != 0));
    }
}
