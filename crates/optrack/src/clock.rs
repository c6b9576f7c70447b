//! Wall-clock source used by the tracker.
//!
//! The tracker never reads the system time directly; it is constructed with
//! a `Clock` so embedding daemons can virtualize time and tests can drive
//! eviction and slow-op deadlines deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Monotonic-enough wall-clock reader returning Unix nanoseconds.
pub trait Clock: Send + Sync {
    fn now_unix_ns(&self) -> u64;
}

/// Process wall clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64
    }
}

/// Manually driven clock for tests and virtualized-time embedders.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_unix_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_unix_ns: u64) -> Self {
        Self {
            now_unix_ns: AtomicU64::new(start_unix_ns),
        }
    }

    /// Build a clock starting at `secs` seconds past the epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(secs.saturating_mul(NANOS_PER_SEC))
    }

    pub fn set_unix_ns(&self, now_unix_ns: u64) {
        self.now_unix_ns.store(now_unix_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) {
        let by_ns = by.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.now_unix_ns.fetch_add(by_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_unix_ns(&self) -> u64 {
        self.now_unix_ns.load(Ordering::Relaxed)
    }
}

/// Convert a nanosecond span to seconds for human-facing output.
pub fn ns_to_secs_f64(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}

/// Render a Unix-nanosecond stamp as `<secs>.<nanos>` text.
///
/// Dumps and warning lines carry timestamps as strings so the wire schema
/// stays stable regardless of the clock's resolution.
pub fn format_unix_ns(unix_ns: u64) -> String {
    let secs = unix_ns / NANOS_PER_SEC;
    let nanos = unix_ns % NANOS_PER_SEC;
    format!("{secs}.{nanos:09}")
}
