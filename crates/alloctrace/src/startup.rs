//! Startup-flag driver.
//!
//! The preload shim hands the `ALLOCTRACE_OPTS` string to this module at
//! load time; it enables the profiler (possibly delayed), schedules
//! periodic dumps, and arms the emergency dump for the host's fatal-error
//! path. Scheduled tasks live for the rest of the process.

use std::sync::Mutex;

use crate::config::{DumpOptions, StartupOptions};
use crate::error::Error;
use crate::{control, report, sched};

/// Environment variable holding the startup option string.
pub const OPTIONS_ENV: &str = "ALLOCTRACE_OPTS";

static EMERGENCY_OPTS: Mutex<Option<DumpOptions>> = Mutex::new(None);

/// Read `ALLOCTRACE_OPTS` and act on it. Parse errors are reported on
/// stderr and leave the profiler untouched.
pub fn init_from_env() {
    let Ok(raw) = std::env::var(OPTIONS_ENV) else {
        return;
    };
    if raw.trim().is_empty() {
        return;
    }
    match StartupOptions::parse(&raw) {
        Ok(opts) => run(opts),
        Err(e) => eprintln!("alloctrace: invalid {OPTIONS_ENV}: {e}"),
    }
}

/// Apply a parsed startup configuration.
pub fn run(opts: StartupOptions) {
    if opts.dump_on_error {
        let mut emergency = opts.dump.clone();
        emergency.on_error = true;
        arm_emergency_dump(emergency);
    }

    if !opts.enable {
        return;
    }

    let enable_opts = opts.enable_opts.clone();
    let exit_on_failure = opts.exit_if_enable_fails;
    match opts.enable_delay {
        Some(delay) if !delay.is_zero() => {
            let task = sched::schedule("alloctrace-enable", Some(delay), delay, Some(1), move || {
                try_enable(&enable_opts, exit_on_failure);
            });
            std::mem::forget(task);
        }
        _ => {
            if !try_enable(&enable_opts, exit_on_failure) {
                return;
            }
        }
    }

    if let Some(interval) = opts.dump_interval {
        let dump_opts = opts.dump.clone();
        let runs = (opts.dump_count > 0).then_some(opts.dump_count);
        let task = sched::schedule("alloctrace-dump", opts.dump_delay, interval, runs, move || {
            if let Err(e) = report::dump(&dump_opts) {
                log::warn!("periodic dump failed: {e}");
            }
        });
        std::mem::forget(task);
    }
}

fn try_enable(opts: &crate::EnableOptions, exit_on_failure: bool) -> bool {
    match control::enable(opts) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("alloctrace: enable failed: {e}");
            if exit_on_failure {
                std::process::exit(1);
            }
            false
        }
    }
}

/// Remember the dump shape the emergency path should use.
pub fn arm_emergency_dump(opts: DumpOptions) {
    let mut slot = EMERGENCY_OPTS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = Some(opts);
}

/// Entry point for the host's fatal-error handler. Must be called from a
/// synchronous error path, not a signal handler. The second and further
/// calls are no-ops, as is calling it with the profiler disabled.
pub fn emergency_dump() {
    let opts = {
        let slot = EMERGENCY_OPTS
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.clone()
    }
    .unwrap_or_else(|| DumpOptions {
        on_error: true,
        ..DumpOptions::default()
    });

    match report::dump(&opts) {
        Ok(()) => {}
        Err(Error::EmergencyDumpAlreadyRan) | Err(Error::AlreadyDisabled) => {}
        Err(e) => log::warn!("emergency dump failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_options_are_used_by_the_emergency_path() {
        let _g = crate::test_util::guard();
        arm_emergency_dump(DumpOptions {
            dump_file: "stderr".into(),
            on_error: true,
            ..DumpOptions::default()
        });
        // Disabled profiler: the emergency path must stay a silent no-op.
        emergency_dump();
    }
}
