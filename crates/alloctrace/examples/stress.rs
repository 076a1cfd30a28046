//! Deterministic allocation-mix driver for exercising the preload shim.
//!
//! Runs a pseudo-random mix over the whole C allocation API from a handful
//! of named call sites and prints its own per-API tallies, so a report
//! produced by the shim can be checked against ground truth:
//!
//! ```bash
//! cargo build --release -p alloctrace-preload
//! cargo build --release --example stress
//! LD_PRELOAD=target/release/liballoctrace_preload.so \
//! ALLOCTRACE_OPTS="enable,track-free,dump-count=1,dump-interval=1s,dump-delay=5s" \
//! target/release/examples/stress --ops 1000000
//! ```
//!
//! Link with `-Wl,--export-dynamic` (or run with `--features`-free dladdr
//! fallback) if you want the `driver_alloc_site_*` names symbolized.

use std::ffi::c_void;
use std::hint::black_box;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "stress")]
#[command(about = "Deterministic allocation mix for alloctrace")]
struct Args {
    /// Number of operations to perform
    #[arg(long, default_value = "1000000")]
    ops: u64,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Largest single allocation in bytes
    #[arg(long, default_value = "4096")]
    max_size: usize,

    /// Print per-site tallies as CSV instead of a table
    #[arg(long)]
    csv: bool,
}

/// Splitmix64; deterministic across runs and platforms.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

#[derive(Default)]
struct Tally {
    allocs: u64,
    alloc_bytes: u64,
    frees: u64,
    live: u64,
    live_bytes: u64,
}

impl Tally {
    fn allocated(&mut self, bytes: usize) {
        self.allocs += 1;
        self.alloc_bytes += bytes as u64;
        self.live += 1;
        self.live_bytes += bytes as u64;
    }

    fn freed(&mut self, bytes: usize) {
        self.frees += 1;
        self.live -= 1;
        self.live_bytes -= bytes as u64;
    }
}

struct Block {
    ptr: *mut c_void,
    size: usize,
    site: usize,
}

const SITE_NAMES: [&str; 6] = [
    "driver_alloc_site_a",
    "driver_alloc_site_b",
    "driver_alloc_site_c",
    "driver_alloc_site_d",
    "driver_alloc_site_e",
    "driver_alloc_site_f",
];

// Each site goes through a distinct, non-inlined function so the captured
// stacks stay distinguishable; the depth argument is opaque to the
// optimizer, which keeps the recursion from being flattened into a tail
// call.

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_a(depth: usize, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_a(depth - 1, size);
    }
    black_box(unsafe { libc::malloc(size) })
}

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_b(depth: usize, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_b(depth - 1, size);
    }
    black_box(unsafe { libc::calloc(1, size) })
}

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_c(depth: usize, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_c(depth - 1, size);
    }
    let mut out: *mut c_void = std::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut out, 64, size) };
    black_box(if rc == 0 { out } else { std::ptr::null_mut() })
}

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_d(depth: usize, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_d(depth - 1, size);
    }
    black_box(unsafe { libc::memalign(128, size) })
}

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_e(depth: usize, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_e(depth - 1, size);
    }
    // aligned_alloc demands size % align == 0.
    let size = size.next_multiple_of(32).max(32);
    black_box(unsafe { libc::aligned_alloc(32, size) })
}

#[unsafe(no_mangle)]
#[inline(never)]
fn driver_alloc_site_f(depth: usize, old: *mut c_void, size: usize) -> *mut c_void {
    if black_box(depth) > 0 {
        return driver_alloc_site_f(depth - 1, old, size);
    }
    black_box(unsafe { libc::realloc(old, size) })
}

fn main() {
    let args = Args::parse();

    let mut rng = Rng(args.seed);
    let mut tallies: Vec<Tally> = (0..SITE_NAMES.len()).map(|_| Tally::default()).collect();
    let mut live: Vec<Block> = Vec::new();

    for _ in 0..args.ops {
        let roll = rng.next();
        let size = 1 + (rng.next() as usize) % args.max_size;
        let depth = 1 + (rng.next() as usize) % 6;

        match roll % 10 {
            // Allocate from one of the five allocating sites.
            0..=4 => {
                let site = (roll / 10) as usize % 5;
                let ptr = match site {
                    0 => driver_alloc_site_a(depth, size),
                    1 => driver_alloc_site_b(depth, size),
                    2 => driver_alloc_site_c(depth, size),
                    3 => driver_alloc_site_d(depth, size),
                    _ => driver_alloc_site_e(depth, size),
                };
                if !ptr.is_null() {
                    let size = unsafe { libc::malloc_usable_size(ptr) };
                    tallies[site].allocated(size);
                    live.push(Block { ptr, size, site });
                }
            }
            // Resize a random live block through site f.
            5..=6 if !live.is_empty() => {
                let idx = (rng.next() as usize) % live.len();
                let block = live.swap_remove(idx);
                tallies[block.site].freed(block.size);
                let ptr = driver_alloc_site_f(depth, block.ptr, size);
                if !ptr.is_null() {
                    let size = unsafe { libc::malloc_usable_size(ptr) };
                    tallies[5].allocated(size);
                    live.push(Block { ptr, size, site: 5 });
                }
            }
            // Free a random live block.
            _ if !live.is_empty() => {
                let idx = (rng.next() as usize) % live.len();
                let block = live.swap_remove(idx);
                tallies[block.site].freed(block.size);
                unsafe { libc::free(block.ptr) };
            }
            _ => {}
        }
    }

    if args.csv {
        println!("site,allocs,alloc_bytes,frees,live,live_bytes");
        for (name, t) in SITE_NAMES.iter().zip(&tallies) {
            println!(
                "{name},{},{},{},{},{}",
                t.allocs, t.alloc_bytes, t.frees, t.live, t.live_bytes
            );
        }
    } else {
        println!(
            "{:<22} {:>10} {:>14} {:>10} {:>10} {:>14}",
            "SITE", "ALLOCS", "ALLOC_BYTES", "FREES", "LIVE", "LIVE_BYTES"
        );
        for (name, t) in SITE_NAMES.iter().zip(&tallies) {
            println!(
                "{name:<22} {:>10} {:>14} {:>10} {:>10} {:>14}",
                t.allocs, t.alloc_bytes, t.frees, t.live, t.live_bytes
            );
        }
        let live_bytes: u64 = tallies.iter().map(|t| t.live_bytes).sum();
        let live_count: u64 = tallies.iter().map(|t| t.live).sum();
        println!("\noutstanding: {live_count} blocks, {live_bytes} bytes");
    }

    // Leak the remaining blocks on purpose; a live-mode report taken at
    // exit should show exactly the outstanding tallies above.
}
