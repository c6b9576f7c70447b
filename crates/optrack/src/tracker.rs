//! Tracker facade: live registry + completed-op history + slow-op checks.
//!
//! Lock order, outermost first: the lifecycle reader-writer lock (shared by
//! every public operation, exclusive only at teardown), one shard mutex at
//! a time, the history mutex, the per-op event mutex. Locks on the same
//! level are never both held; the shard lock is released before an
//! unregistered op is handed to the history.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::clock::{format_unix_ns, ns_to_secs_f64, Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::dump::DumpFormatter;
use crate::histogram::Pow2Histogram;
use crate::history::OpHistory;
use crate::op::{OpState, TrackedOp};
use crate::registry::LiveRegistry;

/// Census result of a slow-op walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowOpStats {
    /// Age of the oldest in-flight op, in seconds.
    pub oldest_secs: f64,
    /// In-flight ops older than the complaint time.
    pub num_slow: usize,
    /// Ops actually passed to the warning callback this walk.
    pub num_warned: usize,
}

/// Human-readable health-check result.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowOpReport {
    /// One-line roll-up, e.g. `3 slow requests, 2 included below; ...`.
    pub summary: String,
    /// One formatted line per warned op.
    pub warnings: Vec<String>,
    pub num_slow: usize,
    pub oldest_secs: f64,
}

/// In-flight operation tracker.
///
/// Producers `register_inflight` an op, mark events on it while working,
/// then `unregister_inflight` it, which moves it into the bounded history.
/// Consumers dump live and historic ops and run slow-op health checks.
pub struct OpTracker {
    lifecycle: RwLock<()>,
    registry: LiveRegistry,
    history: OpHistory,
    clock: Arc<dyn Clock>,
    tracking_enabled: AtomicBool,
    complaint_time_ns: AtomicU64,
    log_threshold: AtomicUsize,
}

impl OpTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Tracker with an injected clock; embedders with virtualized time and
    /// deterministic tests use this constructor.
    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            lifecycle: RwLock::new(()),
            registry: LiveRegistry::new(config.num_shards),
            history: OpHistory::new(
                config.history_size,
                duration_to_ns(config.history_duration),
                duration_to_ns(config.slow_threshold),
                config.slow_history_size,
            ),
            clock,
            tracking_enabled: AtomicBool::new(config.tracking_enabled),
            complaint_time_ns: AtomicU64::new(duration_to_ns(config.complaint_time)),
            log_threshold: AtomicUsize::new(config.log_threshold),
        }
    }

    fn read_lifecycle(&self) -> RwLockReadGuard<'_, ()> {
        self.lifecycle
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lifecycle(&self) -> RwLockWriteGuard<'_, ()> {
        self.lifecycle
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn num_shards(&self) -> usize {
        self.registry.num_shards()
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled.load(Ordering::Relaxed)
    }

    pub fn set_tracking(&self, enabled: bool) {
        self.tracking_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn complaint_time(&self) -> Duration {
        Duration::from_nanos(self.complaint_time_ns.load(Ordering::Relaxed))
    }

    pub fn set_complaint_and_log_threshold(&self, complaint_time: Duration, log_threshold: usize) {
        self.complaint_time_ns
            .store(duration_to_ns(complaint_time), Ordering::Relaxed);
        self.log_threshold.store(log_threshold, Ordering::Relaxed);
    }

    pub fn set_history_size_and_duration(&self, history_size: usize, history_duration: Duration) {
        self.history
            .set_size_and_duration(history_size, duration_to_ns(history_duration));
    }

    pub fn set_slow_op_size_and_threshold(&self, slow_op_size: usize, slow_threshold: Duration) {
        self.history
            .set_slow_op_size_and_threshold(slow_op_size, duration_to_ns(slow_threshold));
    }

    /// Admit an op into the live registry.
    ///
    /// Returns false when tracking is disabled; the op is then never
    /// observed and the caller keeps sole ownership.
    pub fn register_inflight(&self, op: &Arc<dyn TrackedOp>) -> bool {
        if !self.tracking_enabled() {
            return false;
        }
        let _guard = self.read_lifecycle();
        self.registry.register(op);
        true
    }

    /// Release an op: remove it from its shard, fire `on_unregistered`,
    /// then either hand it to the history (tracking enabled) or drop it.
    ///
    /// Calling this for an op whose registration was refused is a caller
    /// bug.
    pub fn unregister_inflight(&self, op: Arc<dyn TrackedOp>) {
        assert!(
            op.core().state() != OpState::Uninitialized,
            "unregister of an op that was never registered"
        );
        let _guard = self.read_lifecycle();
        self.registry.unregister(op.as_ref());
        op.on_unregistered();

        if self.tracking_enabled() {
            let now = self.clock.now_unix_ns();
            op.core().set_completed(now);
            op.core().set_state(OpState::History);
            self.history.insert(now, op);
        }
    }

    /// Dump live ops; `only_blocked` restricts to ops older than the
    /// complaint time. Returns false when tracking is disabled.
    pub fn dump_ops_in_flight(
        &self,
        f: &mut dyn DumpFormatter,
        only_blocked: bool,
        filters: &[String],
    ) -> bool {
        if !self.tracking_enabled() {
            return false;
        }
        let _guard = self.read_lifecycle();
        let now = self.clock.now_unix_ns();
        let complaint_ns = self.complaint_time_ns.load(Ordering::Relaxed);
        self.registry
            .dump_ops(now, f, only_blocked, filters, complaint_ns);
        true
    }

    /// Dump completed ops, in arrival order or slowest-first.
    pub fn dump_historic_ops(
        &self,
        f: &mut dyn DumpFormatter,
        by_duration: bool,
        filters: &[String],
    ) -> bool {
        if !self.tracking_enabled() {
            return false;
        }
        let _guard = self.read_lifecycle();
        let now = self.clock.now_unix_ns();
        if by_duration {
            self.history.dump_ops_by_duration(now, f, filters);
        } else {
            self.history.dump_ops(now, f, filters);
        }
        true
    }

    /// Dump the slow-op sub-history.
    pub fn dump_historic_slow_ops(&self, f: &mut dyn DumpFormatter, filters: &[String]) -> bool {
        if !self.tracking_enabled() {
            return false;
        }
        let _guard = self.read_lifecycle();
        let now = self.clock.now_unix_ns();
        self.history.dump_slow_ops(now, f, filters);
        true
    }

    /// Walk all live ops when the oldest is at least `complaint_time` old.
    ///
    /// Returns the oldest op's age in seconds, or `None` when tracking is
    /// disabled, nothing is in flight, or the oldest op is younger than the
    /// complaint time. The visitor returns false to stop the current
    /// shard's iteration.
    pub fn visit_ops_in_flight(
        &self,
        visit: impl FnMut(&Arc<dyn TrackedOp>) -> bool,
    ) -> Option<f64> {
        if !self.tracking_enabled() {
            return None;
        }
        let now = self.clock.now_unix_ns();
        let _guard = self.read_lifecycle();
        let (oldest, total) = self.registry.oldest_and_total();
        let oldest = oldest?;
        let oldest_age_ns = now.saturating_sub(oldest);
        let oldest_secs = ns_to_secs_f64(oldest_age_ns);
        tracing::debug!(ops_in_flight = total, oldest_secs, "live op census");
        if oldest_age_ns < self.complaint_time_ns.load(Ordering::Relaxed) {
            return None;
        }
        self.registry.visit(visit);
        Some(oldest_secs)
    }

    /// Run the slow-op scan, invoking `on_warn` for each op due a warning.
    ///
    /// The callback is expected to double the op's warn-interval
    /// multiplier once it has actually surfaced the warning.
    pub fn with_slow_ops_in_flight(
        &self,
        mut on_warn: impl FnMut(&Arc<dyn TrackedOp>),
    ) -> Option<SlowOpStats> {
        let now = self.clock.now_unix_ns();
        let mut scan = SlowOpScan::new(
            now,
            self.complaint_time_ns.load(Ordering::Relaxed),
            self.log_threshold.load(Ordering::Relaxed),
        );
        let oldest_secs = self.visit_ops_in_flight(|op| scan.check(op, &mut on_warn))?;
        Some(SlowOpStats {
            oldest_secs,
            num_slow: scan.slow,
            num_warned: scan.warned,
        })
    }

    /// Health check: summary line plus one formatted warning per slow op
    /// that left its backoff window. Warned ops have their backoff doubled.
    pub fn check_ops_in_flight(&self) -> Option<SlowOpReport> {
        let now = self.clock.now_unix_ns();
        let mut warnings = Vec::new();
        let stats = self.with_slow_ops_in_flight(|op| {
            let core = op.core();
            let currently = core
                .current()
                .unwrap_or_else(|| core.state_name().to_string());
            warnings.push(format!(
                "slow request {:.6} seconds old, received at {}: {} currently {currently}",
                ns_to_secs_f64(core.age_ns(now)),
                format_unix_ns(core.initiated_unix_ns()),
                op.describe(),
            ));
            core.double_warn_interval_multiplier();
        })?;
        let summary = format!(
            "{} slow requests, {} included below; oldest blocked for > {:.6} secs",
            stats.num_slow,
            warnings.len(),
            stats.oldest_secs
        );
        Some(SlowOpReport {
            summary,
            warnings,
            num_slow: stats.num_slow,
            oldest_secs: stats.oldest_secs,
        })
    }

    /// Power-of-two histogram of live-op ages in milliseconds.
    pub fn get_age_ms_histogram(&self, h: &mut Pow2Histogram) {
        let _guard = self.read_lifecycle();
        let now = self.clock.now_unix_ns();
        self.registry.age_histogram(now, h);
    }

    /// Teardown: producers must have unregistered every op.
    pub fn shutdown(&self) {
        let _guard = self.write_lifecycle();
        self.registry.assert_all_empty();
        self.history.on_shutdown();
    }
}

/// Per-walk decision state of the slow-op detector.
///
/// Within a shard, ops are in arrival order, so the first op younger than
/// the cutoff ends that shard's scan. Ops inside their backoff window
/// (`initiated + complaint × multiplier` still in the future) are counted
/// but not warned; once `warned` hits the log threshold the walk keeps
/// counting without emitting.
struct SlowOpScan {
    now_unix_ns: u64,
    too_old_unix_ns: u64,
    complaint_ns: u64,
    log_threshold: usize,
    slow: usize,
    warned: usize,
}

impl SlowOpScan {
    fn new(now_unix_ns: u64, complaint_ns: u64, log_threshold: usize) -> Self {
        Self {
            now_unix_ns,
            too_old_unix_ns: now_unix_ns.saturating_sub(complaint_ns),
            complaint_ns,
            log_threshold,
            slow: 0,
            warned: 0,
        }
    }

    fn check(
        &mut self,
        op: &Arc<dyn TrackedOp>,
        on_warn: &mut impl FnMut(&Arc<dyn TrackedOp>),
    ) -> bool {
        let initiated = op.core().initiated_unix_ns();
        if initiated >= self.too_old_unix_ns {
            // Remaining ops in this shard are younger still.
            return false;
        }
        self.slow += 1;
        if self.warned >= self.log_threshold {
            return true;
        }
        let multiplier = u64::from(op.core().warn_interval_multiplier());
        let next_complaint = initiated.saturating_add(self.complaint_ns.saturating_mul(multiplier));
        if next_complaint >= self.now_unix_ns {
            return true;
        }
        self.warned += 1;
        on_warn(op);
        true
    }
}

fn duration_to_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}
