//! Operator-facing options and the startup flag string.

use std::time::Duration;

use crate::error::{Error, Result};

/// Options for `enable`.
#[derive(Debug, Clone)]
pub struct EnableOptions {
    /// Captured frames per stack, in `[2, 31]`.
    pub stack_depth: usize,
    /// Prefer the library unwinder over the frame-pointer walker.
    pub use_backtrace: bool,
    /// Track roughly one in N allocations; 1 tracks everything.
    pub only_nth: u64,
    /// Restart the session if one is already running.
    pub force: bool,
    /// Live mode: debit aggregates when allocations are freed.
    pub track_free: bool,
    /// Keep capture timing and tracking counters.
    pub detailed_stats: bool,
    /// Reserve bytes released on entry to an emergency dump.
    pub rainy_day_fund: usize,
}

impl Default for EnableOptions {
    fn default() -> EnableOptions {
        EnableOptions {
            stack_depth: 12,
            use_backtrace: false,
            only_nth: 1,
            force: false,
            track_free: false,
            detailed_stats: false,
            rainy_day_fund: 0,
        }
    }
}

/// Options for `dump`.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// `"stdout"`, `"stderr"`, or a path; `@pid` expands to the process id.
    pub dump_file: String,
    /// Only print stacks with at least one symbolized frame containing
    /// this substring.
    pub filter: Option<String>,
    /// Maximum stacks to print; 0 means no limit.
    pub max_entries: usize,
    /// Stop once the printed share of the sort key reaches this percent;
    /// 0 disables the cutoff.
    pub percentage: u32,
    /// Sort by allocation count instead of bytes.
    pub sort_by_count: bool,
    /// Keep the reporter's own allocations out of the maps.
    pub hide_dump_allocs: bool,
    /// Append the internal statistics block.
    pub internal_stats: bool,
    /// Emergency path: claim the rainy-day fund and stall other threads'
    /// allocations for the duration. Only legal from synchronous
    /// fatal-error handling, never from an asynchronous signal.
    pub on_error: bool,
    /// Emit CSV instead of the text report.
    pub csv: bool,
}

impl Default for DumpOptions {
    fn default() -> DumpOptions {
        DumpOptions {
            dump_file: "stderr".into(),
            filter: None,
            max_entries: 10,
            percentage: 0,
            sort_by_count: false,
            hide_dump_allocs: true,
            internal_stats: false,
            on_error: false,
            csv: false,
        }
    }
}

/// Everything the startup flag string can configure.
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    /// Enable profiling at startup.
    pub enable: bool,
    /// Wait this long before enabling.
    pub enable_delay: Option<Duration>,
    /// Stop periodic dumping after this many dumps; 0 means forever.
    pub dump_count: u32,
    /// Produce a dump every interval.
    pub dump_interval: Option<Duration>,
    /// Wait this long before the first periodic dump.
    pub dump_delay: Option<Duration>,
    /// Shape of every periodic (and emergency) dump.
    pub dump: DumpOptions,
    pub enable_opts: EnableOptions,
    /// Arm the emergency dump for the host's fatal-error path.
    pub dump_on_error: bool,
    /// Exit the process when enabling fails.
    pub exit_if_enable_fails: bool,
}

const MAX_SPAN_SECS: u64 = 365 * 24 * 60 * 60;

/// Parse a time span: decimal integers each followed by `s`, `m`, `h` or
/// `d`, whitespace permitted between entries. `"1h 30m"` is 5400 seconds.
pub fn parse_span(input: &str) -> Result<Duration> {
    let bad = |detail: &str| Error::InvalidArgument(format!("bad time span '{input}': {detail}"));

    let mut total: u64 = 0;
    let mut chars = input.chars().peekable();
    let mut any = false;

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((c as u8 - b'0') as u64))
                .ok_or_else(|| bad("number too large"))?;
            digits += 1;
        }
        if digits == 0 {
            return Err(bad("expected a number"));
        }

        let unit = match chars.next() {
            Some('s') => 1,
            Some('m') => 60,
            Some('h') => 60 * 60,
            Some('d') => 24 * 60 * 60,
            Some(c) => return Err(bad(&format!("unknown unit '{c}'"))),
            None => return Err(bad("missing unit (s, m, h or d)")),
        };

        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| bad("number too large"))?;
        any = true;
    }

    if !any {
        return Err(bad("empty"));
    }
    if total > MAX_SPAN_SECS {
        return Err(bad("exceeds 365 days"));
    }
    Ok(Duration::from_secs(total))
}

/// Parse a byte count with an optional `k`, `m` or `g` suffix.
pub fn parse_bytes(input: &str) -> Result<usize> {
    let bad = || Error::InvalidArgument(format!("bad byte count '{input}'"));
    let trimmed = input.trim();
    let (digits, mult) = match trimmed.char_indices().last() {
        Some((i, 'k')) | Some((i, 'K')) => (&trimmed[..i], 1usize << 10),
        Some((i, 'm')) | Some((i, 'M')) => (&trimmed[..i], 1usize << 20),
        Some((i, 'g')) | Some((i, 'G')) => (&trimmed[..i], 1usize << 30),
        _ => (trimmed, 1),
    };
    let value: usize = digits.parse().map_err(|_| bad())?;
    value.checked_mul(mult).ok_or_else(bad)
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None => Ok(true),
        Some("true") | Some("1") | Some("yes") | Some("on") => Ok(true),
        Some("false") | Some("0") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(Error::InvalidArgument(format!(
            "bad boolean '{other}' for {key}"
        ))),
    }
}

fn require<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| Error::InvalidArgument(format!("{key} requires a value")))
}

impl StartupOptions {
    /// Parse a `key=value[,key=value...]` option string, e.g.
    /// `enable,track-free,dump-interval=30s,dump-output=/tmp/trace.@pid`.
    pub fn parse(input: &str) -> Result<StartupOptions> {
        let mut opts = StartupOptions::default();
        for item in input.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (item, None),
            };
            match key {
                "enable" => opts.enable = parse_flag(key, value)?,
                "enable-delay" => opts.enable_delay = Some(parse_span(require(key, value)?)?),
                "dump-count" => {
                    opts.dump_count = require(key, value)?.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad count '{}'", value.unwrap_or("")))
                    })?;
                }
                "dump-interval" => opts.dump_interval = Some(parse_span(require(key, value)?)?),
                "dump-delay" => opts.dump_delay = Some(parse_span(require(key, value)?)?),
                "dump-output" => opts.dump.dump_file = require(key, value)?.to_string(),
                "dump-filter" => opts.dump.filter = Some(require(key, value)?.to_string()),
                "dump-percentage" => {
                    let pct: u32 = require(key, value)?.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad percentage '{}'", value.unwrap_or("")))
                    })?;
                    if pct > 100 {
                        return Err(Error::InvalidArgument(format!(
                            "percentage {pct} out of range"
                        )));
                    }
                    opts.dump.percentage = pct;
                }
                "dump-max-entries" => {
                    opts.dump.max_entries = require(key, value)?.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad entry count '{}'", value.unwrap_or("")))
                    })?;
                }
                "dump-sort-by-count" => opts.dump.sort_by_count = parse_flag(key, value)?,
                "dump-hide-allocs" => opts.dump.hide_dump_allocs = parse_flag(key, value)?,
                "dump-internal-stats" => opts.dump.internal_stats = parse_flag(key, value)?,
                "dump-csv" => opts.dump.csv = parse_flag(key, value)?,
                "stack-depth" => {
                    opts.enable_opts.stack_depth = require(key, value)?.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad stack depth '{}'", value.unwrap_or("")))
                    })?;
                }
                "use-backtrace" => opts.enable_opts.use_backtrace = parse_flag(key, value)?,
                "only-nth" => {
                    opts.enable_opts.only_nth = require(key, value)?.parse().map_err(|_| {
                        Error::InvalidArgument(format!("bad only-nth '{}'", value.unwrap_or("")))
                    })?;
                }
                "track-free" => opts.enable_opts.track_free = parse_flag(key, value)?,
                "detailed-stats" => opts.enable_opts.detailed_stats = parse_flag(key, value)?,
                "dump-on-error" => opts.dump_on_error = parse_flag(key, value)?,
                "rainy-day-fund" => {
                    opts.enable_opts.rainy_day_fund = parse_bytes(require(key, value)?)?;
                }
                "exit-if-enable-fails" => opts.exit_if_enable_fails = parse_flag(key, value)?,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown option '{other}'")));
                }
            }
        }
        Ok(opts)
    }
}
