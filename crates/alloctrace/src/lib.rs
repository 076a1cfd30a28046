//! Always-on allocation call-site profiler.
//!
//! alloctrace interposes on the C heap allocation API and aggregates, per
//! unique call stack, the total bytes and count of allocations attributed to
//! that stack. Two modes are supported:
//!
//! - **Cumulative**: every tracked allocation increments its call-stack
//!   aggregate forever; frees are ignored.
//! - **Live**: every matching free decrements the aggregate, so the report
//!   reflects outstanding memory.
//!
//! The interposition layer is exported as C symbols by the companion
//! `alloctrace-preload` cdylib:
//!
//! ```bash
//! LD_PRELOAD=target/release/liballoctrace_preload.so \
//! ALLOCTRACE_OPTS="enable,track-free,dump-interval=30s,dump-output=/tmp/at.@pid" \
//! ./your_program
//! ```
//!
//! Build with frame pointers so the fallback stack walker sees real frames:
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release
//! ```
//!
//! Embedders can also drive the profiler directly through [`enable`],
//! [`disable`] and [`dump`].

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod interpose;
pub mod report;
pub mod sched;
pub mod startup;

pub use config::{EnableOptions, DumpOptions, StartupOptions};
pub use control::{disable, enable};
pub use error::{Error, Result};
pub use report::dump;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    // The profiler is process-global state; tests that enable, disable or
    // register hooks serialize on this.
    static LOCK: Mutex<()> = Mutex::new(());

    pub fn guard() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
