//! Periodic task scheduler for the startup driver.
//!
//! One named background thread per task, firing a closure after an
//! optional initial delay and then every interval, for a bounded or
//! unbounded number of runs. Cancellation is polled so a task never
//! outlives its welcome by more than one poll tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_TICK: Duration = Duration::from_millis(200);

pub struct PeriodicTask {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Stop the task and wait for its thread to exit.
    pub fn cancel(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Run `f` every `interval`, starting after `delay`, at most `runs` times
/// (`None` for unbounded).
pub fn schedule<F>(
    name: &str,
    delay: Option<Duration>,
    interval: Duration,
    runs: Option<u32>,
    mut f: F,
) -> PeriodicTask
where
    F: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(delay) = delay {
                if sleep_interruptibly(&stop_flag, delay) {
                    return;
                }
            }
            let mut remaining = runs;
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                f();
                if let Some(ref mut left) = remaining {
                    *left -= 1;
                    if *left == 0 {
                        return;
                    }
                }
                if sleep_interruptibly(&stop_flag, interval) {
                    return;
                }
            }
        })
        .expect("failed to spawn scheduler thread");

    PeriodicTask {
        stop,
        handle: Some(handle),
    }
}

/// Sleep in small ticks; true means the task was cancelled meanwhile.
fn sleep_interruptibly(stop: &AtomicBool, total: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let tick = POLL_TICK.min(total - slept);
        thread::sleep(tick);
        slept += tick;
    }
    stop.load(Ordering::Relaxed)
}
