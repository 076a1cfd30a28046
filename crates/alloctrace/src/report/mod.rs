//! Report generation.
//!
//! A dump snapshots every stack shard under its own lock, merges the
//! per-shard snapshots largest-first, applies the entry limit, percentage
//! cutoff and symbol filter, and streams the result to a sink. The
//! reporter suspends tracking on its own thread so none of this shows up
//! in the maps it is reading.

pub mod sink;
pub mod symbolize;

use std::collections::BinaryHeap;

use crate::config::DumpOptions;
use crate::control;
use crate::engine::addrset::AddrSet;
use crate::engine::capture::{CAPTURE_COUNT, CAPTURE_NANOS};
use crate::engine::stackmap::SnapEntry;
use crate::engine::tracker;
use crate::engine::{ALLOC_MAP, STACK_MAP};
use crate::error::{Error, Result};
use crate::interpose;
use sink::OutputSink;
use symbolize::{DladdrSymbolizer, Symbolizer, format_frame};

/// Produce a report per `opts`, resolving symbols with `dladdr`.
pub fn dump(opts: &DumpOptions) -> Result<()> {
    let mut sink = sink::open(&opts.dump_file)?;
    dump_to(opts, &mut *sink, &DladdrSymbolizer)
}

/// Produce a report into a caller-provided sink and symbolizer.
pub fn dump_to(
    opts: &DumpOptions,
    sink: &mut dyn OutputSink,
    symbolizer: &dyn Symbolizer,
) -> Result<()> {
    if opts.percentage > 100 {
        return Err(Error::InvalidArgument(format!(
            "percentage {} out of range",
            opts.percentage
        )));
    }

    let _g = control::lock();

    // Refuse before touching any emergency state: a dump attempt against a
    // disabled profiler must not spend the one-shot rainy-day claim.
    if !control::enabled() {
        return Err(Error::AlreadyDisabled);
    }

    // The emergency path claims its one shot, releases the reserve for
    // heap headroom, and parks every other thread's allocations on the
    // control mutex until the report is out.
    let mut restore_hooks = None;
    if opts.on_error {
        if !control::claim_rainy_day() {
            return Err(Error::EmergencyDumpAlreadyRan);
        }
        restore_hooks = Some(interpose::register_hooks(Some(&control::BLOCKING_HOOKS)));
    }

    let result = {
        let _suspended = opts.hide_dump_allocs.then(tracker::suspend_tracking);
        run_dump(opts, sink, symbolizer)
    };

    if let Some(prev) = restore_hooks {
        interpose::register_hooks(prev);
    }
    result
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SortKey {
    Bytes,
    Count,
}

impl SortKey {
    fn of(self, entry: &SnapEntry) -> u64 {
        match self {
            SortKey::Bytes => entry.bytes,
            SortKey::Count => entry.count,
        }
    }
}

/// Merge cursor; ordered by sort key, ties on the aggregate address so the
/// emission order is deterministic.
#[derive(PartialEq, Eq)]
struct Head {
    key: u64,
    tie: usize,
    shard: usize,
}

impl Ord for Head {
    fn cmp(&self, other: &Head) -> std::cmp::Ordering {
        (self.key, self.tie, self.shard).cmp(&(other.key, other.tie, other.shard))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Head) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn run_dump(opts: &DumpOptions, sink: &mut dyn OutputSink, symbolizer: &dyn Symbolizer) -> Result<()> {
    let key = if opts.sort_by_count {
        SortKey::Count
    } else {
        SortKey::Bytes
    };

    let mut shards: Vec<Vec<SnapEntry>> = (0..STACK_MAP.shard_count())
        .map(|i| STACK_MAP.snapshot_shard(i))
        .collect();

    let mut total_bytes = 0u64;
    let mut total_count = 0u64;
    for shard in &shards {
        for entry in shard {
            total_bytes += entry.bytes;
            total_count += entry.count;
        }
    }
    let unique_stacks = STACK_MAP.unique_stacks();

    for shard in &mut shards {
        shard.sort_unstable_by(|a, b| {
            (key.of(b), b.agg as usize).cmp(&(key.of(a), a.agg as usize))
        });
    }

    // Cut off once the printed share of the sort key reaches the requested
    // percentage of its total.
    let key_total = match key {
        SortKey::Bytes => total_bytes,
        SortKey::Count => total_count,
    };
    let threshold = (opts.percentage > 0).then(|| key_total * opts.percentage as u64 / 100);
    let max_entries = if opts.max_entries == 0 {
        usize::MAX
    } else {
        opts.max_entries
    };

    let mut heap: BinaryHeap<Head> = BinaryHeap::new();
    let mut cursors = vec![0usize; shards.len()];
    for (i, shard) in shards.iter().enumerate() {
        if let Some(entry) = shard.first() {
            heap.push(Head {
                key: key.of(entry),
                tie: entry.agg as usize,
                shard: i,
            });
        }
    }

    let mut nonmatching = AddrSet::new(4096);
    let mut selected: Vec<SnapEntry> = Vec::new();
    let mut printed_key = 0u64;

    while let Some(head) = heap.pop() {
        if selected.len() >= max_entries {
            break;
        }
        if let Some(t) = threshold {
            if printed_key >= t {
                break;
            }
        }

        let entry = shards[head.shard][cursors[head.shard]];
        cursors[head.shard] += 1;
        if let Some(next) = shards[head.shard].get(cursors[head.shard]) {
            heap.push(Head {
                key: key.of(next),
                tie: next.agg as usize,
                shard: head.shard,
            });
        }

        if let Some(filter) = opts.filter.as_deref() {
            if !entry_matches(&entry, filter, symbolizer, &mut nonmatching) {
                continue;
            }
        }

        printed_key += key.of(&entry);
        selected.push(entry);
    }

    let totals = Totals {
        total_bytes,
        total_count,
        unique_stacks,
        printed_bytes: selected.iter().map(|e| e.bytes).sum(),
        printed_count: selected.iter().map(|e| e.count).sum(),
    };

    if opts.csv {
        write_csv(sink, symbolizer, &selected, &totals)?;
    } else {
        write_text(opts, sink, symbolizer, &selected, &totals)?;
    }
    sink.flush()?;
    Ok(())
}

fn entry_matches(
    entry: &SnapEntry,
    filter: &str,
    symbolizer: &dyn Symbolizer,
    nonmatching: &mut AddrSet,
) -> bool {
    let frames = unsafe { (*entry.agg).frames() };
    for &addr in frames {
        if nonmatching.contains(addr) {
            continue;
        }
        if format_frame(symbolizer, addr).contains(filter) {
            return true;
        }
        nonmatching.insert(addr);
    }
    false
}

struct Totals {
    total_bytes: u64,
    total_count: u64,
    unique_stacks: u64,
    printed_bytes: u64,
    printed_count: u64,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn write_text(
    opts: &DumpOptions,
    sink: &mut dyn OutputSink,
    symbolizer: &dyn Symbolizer,
    selected: &[SnapEntry],
    totals: &Totals,
) -> Result<()> {
    let mode = if control::live_mode() {
        "live allocations"
    } else {
        "cumulative allocations"
    };
    let method = match control::capture_method() {
        crate::engine::capture::CaptureMethod::Unwinder => "library unwinder",
        crate::engine::capture::CaptureMethod::FramePointers => "frame-pointer walk",
    };
    sink.println(&format!("alloctrace report: {mode}, {method}"))?;
    if let Some(filter) = opts.filter.as_deref() {
        sink.println(&format!("filter: \"{filter}\""))?;
    }
    sink.println("")?;

    for (rank, entry) in selected.iter().enumerate() {
        sink.println(&format!(
            "Stack {} of {}: {} bytes ({:.1} %), {} counts ({:.1} %)",
            rank + 1,
            selected.len(),
            entry.bytes,
            percent(entry.bytes, totals.total_bytes),
            entry.count,
            percent(entry.count, totals.total_count),
        ))?;
        let frames = unsafe { (*entry.agg).frames() };
        for &addr in frames {
            sink.println(&format!(
                "  [{addr:#018x}]  {}",
                format_frame(symbolizer, addr)
            ))?;
        }
        sink.println("")?;
    }

    sink.println(&format!(
        "Total: {} bytes, {} counts",
        totals.total_bytes, totals.total_count
    ))?;
    sink.println(&format!(
        "Printed: {} bytes, {} counts",
        totals.printed_bytes, totals.printed_count
    ))?;
    let live_note = if control::live_mode() {
        " (including stacks with no alive allocations)"
    } else {
        ""
    };
    sink.println(&format!(
        "Unique stacks: {}{live_note}",
        totals.unique_stacks
    ))?;

    if opts.internal_stats {
        write_internal_stats(sink)?;
    }
    Ok(())
}

fn write_internal_stats(sink: &mut dyn OutputSink) -> Result<()> {
    let stack = STACK_MAP.stats();
    let alloc = ALLOC_MAP.stats();
    let track = tracker::stats();
    let captures = CAPTURE_COUNT.load(core::sync::atomic::Ordering::Relaxed);
    let capture_nanos = CAPTURE_NANOS.load(core::sync::atomic::Ordering::Relaxed);

    sink.println("")?;
    sink.println("Internal statistics:")?;
    sink.println(&format!(
        "  stack map: {} entries, largest shard {}, bucket bytes {}, slab bytes {}",
        stack.entries, stack.largest_shard, stack.bucket_bytes, stack.slab_bytes
    ))?;
    sink.println(&format!(
        "  alloc map: {} entries, largest shard {}, bucket bytes {}, slab bytes {}",
        alloc.entries, alloc.largest_shard, alloc.bucket_bytes, alloc.slab_bytes
    ))?;
    sink.println(&format!("  reserve: {} bytes", control::reserve_size()))?;
    if captures > 0 {
        sink.println(&format!(
            "  captures: {} (avg {} ns)",
            captures,
            capture_nanos / captures
        ))?;
    } else {
        sink.println("  captures: 0")?;
    }
    sink.println(&format!(
        "  tracked: {}, untracked: {}, failed frees: {}",
        track.tracked, track.untracked, track.failed_frees
    ))?;
    Ok(())
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn write_csv(
    sink: &mut dyn OutputSink,
    symbolizer: &dyn Symbolizer,
    selected: &[SnapEntry],
    totals: &Totals,
) -> Result<()> {
    sink.println("rank,bytes,bytes_percent,count,count_percent,frame,address,symbol")?;
    for (rank, entry) in selected.iter().enumerate() {
        let frames = unsafe { (*entry.agg).frames() };
        for (i, &addr) in frames.iter().enumerate() {
            sink.println(&format!(
                "{},{},{:.1},{},{:.1},{},{:#x},{}",
                rank + 1,
                entry.bytes,
                percent(entry.bytes, totals.total_bytes),
                entry.count,
                percent(entry.count, totals.total_count),
                i,
                addr,
                csv_quote(&format_frame(symbolizer, addr)),
            ))?;
        }
    }
    Ok(())
}
