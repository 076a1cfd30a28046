//! Report pipeline tests: sorting, cutoffs, filtering, formats, and the
//! emergency path. Allocations are fed through the interposer entry bodies
//! from distinct wrappers so the maps hold a known population.

use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloctrace::engine::STACK_MAP;
use alloctrace::engine::tracker::ENGINE_HOOKS;
use alloctrace::interpose::{self, free_entry, malloc_entry};
use alloctrace::report::sink::BufferSink;
use alloctrace::report::symbolize::{Symbol, Symbolizer};
use alloctrace::report::{dump, dump_to};
use alloctrace::{DumpOptions, EnableOptions, Error, disable, enable};

static LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline(never)]
fn site_big(size: usize) -> *mut c_void {
    unsafe { malloc_entry(size, 0x0b1c_0000 as *mut c_void) }
}

#[inline(never)]
fn site_mid(size: usize) -> *mut c_void {
    unsafe { malloc_entry(size, 0x0b2c_0000 as *mut c_void) }
}

#[inline(never)]
fn site_small(size: usize) -> *mut c_void {
    unsafe { malloc_entry(size, 0x0b3c_0000 as *mut c_void) }
}

/// Maps chosen real frame addresses to fixed names; everything else is
/// unknown code.
#[derive(Default)]
struct CannedSymbolizer {
    names: HashMap<usize, &'static str>,
}

impl Symbolizer for CannedSymbolizer {
    fn symbolize(&self, addr: usize) -> Option<Symbol> {
        self.names.get(&addr).map(|name| Symbol {
            name: (*name).to_string(),
            offset: 0x10,
            library: "/lib/libdriver.so".to_string(),
        })
    }
}

/// Find the aggregate with the given byte total and return its frames.
fn frames_of_agg_with_bytes(bytes: u64) -> Vec<usize> {
    for shard in 0..STACK_MAP.shard_count() {
        for entry in STACK_MAP.snapshot_shard(shard) {
            if entry.bytes == bytes {
                return unsafe { (*entry.agg).frames().to_vec() };
            }
        }
    }
    panic!("no aggregate with {bytes} bytes");
}

fn stack_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|l| l.starts_with("Stack ")).collect()
}

/// Cumulative session with three sites: 600, 300 and 100 bytes.
fn populate_three_sites() {
    enable(&EnableOptions {
        force: true,
        ..EnableOptions::default()
    })
    .unwrap();
    for _ in 0..6 {
        unsafe { free_entry(site_big(100), core::ptr::null_mut()) };
    }
    for _ in 0..2 {
        unsafe { free_entry(site_mid(150), core::ptr::null_mut()) };
    }
    unsafe { free_entry(site_small(100), core::ptr::null_mut()) };
}

#[test]
fn entries_come_out_sorted_by_bytes() {
    let _g = serial();
    populate_three_sites();

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();

    let lines = stack_lines(&text);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("Stack 1 of 3: 600 bytes"), "{}", lines[0]);
    assert!(lines[1].starts_with("Stack 2 of 3: 300 bytes"), "{}", lines[1]);
    assert!(lines[2].starts_with("Stack 3 of 3: 100 bytes"), "{}", lines[2]);
    assert!(text.contains("Total: 1000 bytes, 9 counts"));
    assert!(text.contains("Printed: 1000 bytes, 9 counts"));
    assert!(text.contains("Unique stacks: 3"));
    assert!(text.contains("cumulative allocations"));

    disable().unwrap();
}

#[test]
fn sort_by_count_reorders_the_report() {
    let _g = serial();
    enable(&EnableOptions {
        force: true,
        ..EnableOptions::default()
    })
    .unwrap();
    // One big allocation against many small ones: the two sort keys
    // disagree about which site comes first.
    unsafe { free_entry(site_big(1000), core::ptr::null_mut()) };
    for _ in 0..10 {
        unsafe { free_entry(site_small(10), core::ptr::null_mut()) };
    }

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let by_bytes = sink.text();
    assert!(stack_lines(&by_bytes)[0].contains("1000 bytes"));

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            sort_by_count: true,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let by_count = sink.text();
    assert!(
        stack_lines(&by_count)[0].contains("10 counts"),
        "{by_count}"
    );

    disable().unwrap();
}

#[test]
fn max_entries_caps_the_report() {
    let _g = serial();
    populate_three_sites();

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            max_entries: 2,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();

    let lines = stack_lines(&text);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Stack 1 of 2: 600 bytes"));
    assert!(text.contains("Printed: 900 bytes, 8 counts"));
    assert!(text.contains("Total: 1000 bytes, 9 counts"));

    disable().unwrap();
}

#[test]
fn percentage_cutoff_prints_a_minimal_covering_set() {
    let _g = serial();
    populate_three_sites();

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            percentage: 90,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();

    // 600 + 300 covers 90% of 1000; the 100-byte stack is not needed.
    let lines = stack_lines(&text);
    assert_eq!(lines.len(), 2);
    assert!(text.contains("Printed: 900 bytes"));

    disable().unwrap();
}

#[test]
fn filter_keeps_only_stacks_with_a_matching_frame() {
    let _g = serial();
    populate_three_sites();

    // Pick a frame that appears only in the big site's stack; leading
    // frames may be dispatcher code shared by every aggregate.
    let big_frames = frames_of_agg_with_bytes(600);
    let mid_frames = frames_of_agg_with_bytes(300);
    let small_frames = frames_of_agg_with_bytes(100);
    let unique_frame = big_frames
        .iter()
        .copied()
        .find(|a| !mid_frames.contains(a) && !small_frames.contains(a))
        .expect("big site has a distinguishing frame");

    let mut symbolizer = CannedSymbolizer::default();
    symbolizer
        .names
        .insert(unique_frame, "driver_alloc_site_big");

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            filter: Some("driver_alloc_site_big".into()),
            ..DumpOptions::default()
        },
        &mut sink,
        &symbolizer,
    )
    .unwrap();
    let text = sink.text();

    let lines = stack_lines(&text);
    assert_eq!(lines.len(), 1, "{text}");
    assert!(lines[0].contains("600 bytes"));
    assert!(text.contains("driver_alloc_site_big + 0x10  /lib/libdriver.so"));
    assert!(text.contains("filter: \"driver_alloc_site_big\""));

    // A filter that matches nothing prints zero stacks.
    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            filter: Some("no_such_symbol".into()),
            ..DumpOptions::default()
        },
        &mut sink,
        &symbolizer,
    )
    .unwrap();
    let text = sink.text();
    assert!(stack_lines(&text).is_empty());
    assert!(text.contains("Printed: 0 bytes, 0 counts"));

    disable().unwrap();
}

#[test]
fn consecutive_dumps_are_identical() {
    let _g = serial();
    populate_three_sites();

    let opts = DumpOptions::default();
    let mut first = BufferSink::default();
    dump_to(&opts, &mut first, &CannedSymbolizer::default()).unwrap();
    let mut second = BufferSink::default();
    dump_to(&opts, &mut second, &CannedSymbolizer::default()).unwrap();
    assert_eq!(first.text(), second.text());

    disable().unwrap();
}

#[test]
fn csv_mode_emits_header_and_quoted_rows() {
    let _g = serial();
    populate_three_sites();

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            csv: true,
            max_entries: 1,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();

    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "rank,bytes,bytes_percent,count,count_percent,frame,address,symbol"
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("1,600,60.0,6,"), "{row}");
    assert!(row.ends_with("\"<unknown code>\""), "{row}");

    disable().unwrap();
}

#[test]
fn live_mode_report_carries_the_live_annotations() {
    let _g = serial();
    enable(&EnableOptions {
        force: true,
        track_free: true,
        ..EnableOptions::default()
    })
    .unwrap();

    let p = site_big(64);
    unsafe { free_entry(p, core::ptr::null_mut()) };
    let q = site_mid(128);

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();

    assert!(text.contains("live allocations"));
    // The freed site keeps its aggregate but prints nothing.
    assert_eq!(stack_lines(&text).len(), 1);
    assert!(text.contains("Unique stacks: 2 (including stacks with no alive allocations)"));

    unsafe { free_entry(q, core::ptr::null_mut()) };
    disable().unwrap();
}

#[test]
fn internal_stats_block_is_opt_in() {
    let _g = serial();
    populate_three_sites();

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    assert!(!sink.text().contains("Internal statistics:"));

    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions {
            internal_stats: true,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();
    let text = sink.text();
    assert!(text.contains("Internal statistics:"));
    assert!(text.contains("stack map: 3 entries"));
    assert!(text.contains("tracked: 9, untracked: 0, failed frees: 0"));

    disable().unwrap();
}

#[test]
fn dump_file_spec_writes_a_pid_expanded_file() {
    let _g = serial();
    populate_three_sites();

    let path_spec = format!(
        "{}/alloctrace-test-@pid.txt",
        std::env::temp_dir().display()
    );
    let resolved = path_spec.replace("@pid", &std::process::id().to_string());
    dump(&DumpOptions {
        dump_file: path_spec,
        ..DumpOptions::default()
    })
    .unwrap();

    let written = std::fs::read_to_string(&resolved).unwrap();
    assert!(written.contains("Total: 1000 bytes, 9 counts"));
    std::fs::remove_file(&resolved).unwrap();

    disable().unwrap();
}

#[test]
fn dumping_while_disabled_is_an_operator_error() {
    let _g = serial();
    let mut sink = BufferSink::default();
    let err = dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::AlreadyDisabled));
}

#[test]
fn emergency_attempt_while_disabled_does_not_spend_the_claim() {
    let _g = serial();
    let emergency = DumpOptions {
        on_error: true,
        ..DumpOptions::default()
    };

    // Both attempts against a disabled profiler report the state error; if
    // the first had consumed the one-shot claim, the second would come
    // back as EmergencyDumpAlreadyRan instead.
    for _ in 0..2 {
        let mut sink = BufferSink::default();
        let err = dump_to(&emergency, &mut sink, &CannedSymbolizer::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyDisabled));
    }

    // A real emergency dump in the next session still gets its shot.
    enable(&EnableOptions {
        force: true,
        rainy_day_fund: 64 << 10,
        ..EnableOptions::default()
    })
    .unwrap();
    unsafe { free_entry(site_mid(32), core::ptr::null_mut()) };
    let mut sink = BufferSink::default();
    dump_to(&emergency, &mut sink, &CannedSymbolizer::default()).unwrap();
    assert!(sink.text().contains("Total: 32 bytes, 1 counts"));

    disable().unwrap();
}

#[test]
fn emergency_dump_runs_once_and_restores_hooks() {
    let _g = serial();
    enable(&EnableOptions {
        force: true,
        rainy_day_fund: 1 << 20,
        ..EnableOptions::default()
    })
    .unwrap();
    unsafe { free_entry(site_small(64), core::ptr::null_mut()) };

    let emergency = DumpOptions {
        on_error: true,
        ..DumpOptions::default()
    };
    let mut sink = BufferSink::default();
    dump_to(&emergency, &mut sink, &CannedSymbolizer::default()).unwrap();
    assert!(sink.text().contains("Total: 64 bytes, 1 counts"));

    // The engine hook set is back in place afterwards.
    let prev = interpose::register_hooks(None);
    assert!(prev.is_some_and(|t| core::ptr::eq(t, &ENGINE_HOOKS)));
    interpose::register_hooks(prev);

    // Second emergency attempt is refused.
    let mut sink = BufferSink::default();
    let err = dump_to(&emergency, &mut sink, &CannedSymbolizer::default()).unwrap_err();
    assert!(matches!(err, Error::EmergencyDumpAlreadyRan));

    // A plain dump still works.
    let mut sink = BufferSink::default();
    dump_to(
        &DumpOptions::default(),
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap();

    disable().unwrap();
}

#[test]
fn percentage_out_of_range_is_rejected() {
    let _g = serial();
    let mut sink = BufferSink::default();
    let err = dump_to(
        &DumpOptions {
            percentage: 101,
            ..DumpOptions::default()
        },
        &mut sink,
        &CannedSymbolizer::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
