//! Opt-in wall-clock timing for named operations.
//!
//! Replay stages and CLI commands wrap their work in [`timed`]. When timing
//! is off (the default) `timed` is a plain call. When on, every call leaves a
//! sample in a thread-local buffer that [`collect_report`] drains.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Environment variable that switches timing on.
pub const TIMING_ENV: &str = "FILAMENT_TIMING";

/// Samples for one operation name, aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpTiming {
    pub name: String,
    pub count: usize,
    #[serde(rename = "total_us", serialize_with = "serialize_micros")]
    pub total: Duration,
    #[serde(rename = "p50_us", serialize_with = "serialize_micros")]
    pub p50: Duration,
    #[serde(rename = "max_us", serialize_with = "serialize_micros")]
    pub max: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimingReport {
    pub operations: Vec<OpTiming>,
}

thread_local! {
    static SAMPLES: RefCell<Vec<(String, Duration)>> = const { RefCell::new(Vec::new()) };
}

static ENABLED: AtomicBool = AtomicBool::new(false);

/// True when `FILAMENT_TIMING` holds a truthy value (`1`, `true`, `yes`, `on`).
#[must_use]
pub fn timing_enabled_from_env() -> bool {
    std::env::var(TIMING_ENV).is_ok_and(|v| is_truthy(&v))
}

/// Turn collection on or off. Turning it off drops buffered samples.
pub fn set_timing_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
    if !enabled {
        clear_timings();
    }
}

#[must_use]
pub fn is_timing_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn clear_timings() {
    SAMPLES.with(|s| s.borrow_mut().clear());
}

/// Run `f`, recording how long it took under `name` when timing is on.
pub fn timed<R>(name: &str, f: impl FnOnce() -> R) -> R {
    if !is_timing_enabled() {
        return f();
    }
    let started = Instant::now();
    let out = f();
    record(name, started.elapsed());
    out
}

/// Drain this thread's samples into a report, grouped by name.
#[must_use]
pub fn collect_report() -> TimingReport {
    let samples = SAMPLES.with(|s| std::mem::take(&mut *s.borrow_mut()));

    let mut grouped: BTreeMap<String, Vec<Duration>> = BTreeMap::new();
    for (name, elapsed) in samples {
        grouped.entry(name).or_default().push(elapsed);
    }

    let operations = grouped
        .into_iter()
        .map(|(name, mut values)| {
            values.sort_unstable();
            OpTiming {
                count: values.len(),
                total: values.iter().sum(),
                p50: values[(values.len() - 1) / 2],
                max: values[values.len() - 1],
                name,
            }
        })
        .collect();
    TimingReport { operations }
}

impl TimingReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Plain-text table for stderr.
    #[must_use]
    pub fn display_table(&self) -> String {
        if self.is_empty() {
            return "no timing samples recorded\n".to_string();
        }
        let mut out = format!(
            "{:<24} {:>6} {:>10} {:>10} {:>10}\n",
            "operation", "count", "total", "p50", "max"
        );
        for op in &self.operations {
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>10} {:>10} {:>10}",
                op.name,
                op.count,
                format_duration(op.total),
                format_duration(op.p50),
                format_duration(op.max),
            );
        }
        out
    }
}

fn record(name: &str, elapsed: Duration) {
    SAMPLES.with(|s| s.borrow_mut().push((name.to_string(), elapsed)));
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_micros())
}

/// Human-readable duration: `1.250s`, `3.004ms` or `17µs`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros >= 1_000_000 {
        format!("{}.{:03}s", micros / 1_000_000, (micros % 1_000_000) / 1_000)
    } else if micros >= 1_000 {
        format!("{}.{:03}ms", micros / 1_000, micros % 1_000)
    } else {
        format!("{micros}µs")
    }
}

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| value.trim().eq_ignore_ascii_case(t))
}
