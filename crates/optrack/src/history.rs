//! Bounded history of completed operations.
//!
//! Three ordered indexes share handles to the same ops:
//! - `arrived`: keyed by `(initiated_at, seq)`, ascending arrival.
//! - `by_duration`: keyed by `(duration, seq)`, ascending duration.
//! - `slow`: arrival-keyed sub-history of ops at or above the slow
//!   threshold.
//!
//! Eviction runs on every insert and dump, in a fixed order: expire by age
//! first, then trim `by_duration` from the fast end (retention biases
//! toward the slowest completions), then trim `slow` from the old end.
//! The sweeps are independent: a slow op can outlive its main-history
//! entries because the size sweep drops fastest-first while the slow sweep
//! drops oldest-first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::NANOS_PER_SEC;
use crate::dump::DumpFormatter;
use crate::op::TrackedOp;

/// Composite key disambiguating ops that share a primary stamp.
type HistoryKey = (u64, u64);
type HistoryIndex = BTreeMap<HistoryKey, Arc<dyn TrackedOp>>;

#[derive(Default)]
struct HistoryInner {
    arrived: HistoryIndex,
    by_duration: HistoryIndex,
    slow: HistoryIndex,
    shutdown: bool,
}

/// Dual-indexed completed-op history plus the slow-op sub-history.
pub(crate) struct OpHistory {
    inner: Mutex<HistoryInner>,
    history_size: AtomicUsize,
    history_duration_ns: AtomicU64,
    slow_op_threshold_ns: AtomicU64,
    slow_op_size: AtomicUsize,
}

impl OpHistory {
    pub(crate) fn new(
        history_size: usize,
        history_duration_ns: u64,
        slow_op_threshold_ns: u64,
        slow_op_size: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            history_size: AtomicUsize::new(history_size),
            history_duration_ns: AtomicU64::new(history_duration_ns),
            slow_op_threshold_ns: AtomicU64::new(slow_op_threshold_ns),
            slow_op_size: AtomicUsize::new(slow_op_size),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_size_and_duration(&self, history_size: usize, history_duration_ns: u64) {
        self.history_size.store(history_size, Ordering::Relaxed);
        self.history_duration_ns
            .store(history_duration_ns, Ordering::Relaxed);
    }

    pub(crate) fn set_slow_op_size_and_threshold(
        &self,
        slow_op_size: usize,
        slow_op_threshold_ns: u64,
    ) {
        self.slow_op_size.store(slow_op_size, Ordering::Relaxed);
        self.slow_op_threshold_ns
            .store(slow_op_threshold_ns, Ordering::Relaxed);
    }

    /// Take ownership of a completed op; dropped silently after shutdown.
    pub(crate) fn insert(&self, now_unix_ns: u64, op: Arc<dyn TrackedOp>) {
        let mut inner = self.lock();
        if inner.shutdown {
            return;
        }
        let seq = op.core().seq();
        let initiated = op.core().initiated_unix_ns();
        let duration = op.core().duration_ns(now_unix_ns);
        inner.by_duration.insert((duration, seq), Arc::clone(&op));
        if duration >= self.slow_op_threshold_ns.load(Ordering::Relaxed) {
            inner.slow.insert((initiated, seq), Arc::clone(&op));
        }
        inner.arrived.insert((initiated, seq), op);
        self.cleanup(now_unix_ns, &mut inner);
    }

    fn cleanup(&self, now_unix_ns: u64, inner: &mut HistoryInner) {
        let duration_limit = self.history_duration_ns.load(Ordering::Relaxed);
        loop {
            let Some((&(initiated, seq), op)) = inner.arrived.first_key_value() else {
                break;
            };
            if now_unix_ns.saturating_sub(initiated) <= duration_limit {
                break;
            }
            let duration_key = (op.core().duration_ns(now_unix_ns), seq);
            inner.by_duration.remove(&duration_key);
            inner.arrived.remove(&(initiated, seq));
        }

        let history_size = self.history_size.load(Ordering::Relaxed);
        while inner.by_duration.len() > history_size {
            let Some((&(duration, seq), op)) = inner.by_duration.first_key_value() else {
                break;
            };
            let arrived_key = (op.core().initiated_unix_ns(), seq);
            inner.arrived.remove(&arrived_key);
            inner.by_duration.remove(&(duration, seq));
        }

        let slow_op_size = self.slow_op_size.load(Ordering::Relaxed);
        while inner.slow.len() > slow_op_size {
            inner.slow.pop_first();
        }
    }

    /// Emit the history in ascending arrival order.
    pub(crate) fn dump_ops(&self, now_unix_ns: u64, f: &mut dyn DumpFormatter, filters: &[String]) {
        let mut inner = self.lock();
        self.cleanup(now_unix_ns, &mut inner);
        self.open_history_section(f);
        f.open_array("ops");
        for op in inner.arrived.values() {
            if !op.filter_match(filters) {
                continue;
            }
            f.open_object("op");
            op.dump(now_unix_ns, f);
            f.close_section();
        }
        f.close_section();
        f.close_section();
    }

    /// Emit the history slowest-first.
    pub(crate) fn dump_ops_by_duration(
        &self,
        now_unix_ns: u64,
        f: &mut dyn DumpFormatter,
        filters: &[String],
    ) {
        let mut inner = self.lock();
        self.cleanup(now_unix_ns, &mut inner);
        self.open_history_section(f);
        f.open_array("ops");
        for op in inner.by_duration.values().rev() {
            if !op.filter_match(filters) {
                continue;
            }
            f.open_object("op");
            op.dump(now_unix_ns, f);
            f.close_section();
        }
        f.close_section();
        f.close_section();
    }

    /// Emit the slow sub-history in ascending arrival order.
    ///
    /// Section and field names keep their historical casing; admin tooling
    /// parses them as-is.
    pub(crate) fn dump_slow_ops(
        &self,
        now_unix_ns: u64,
        f: &mut dyn DumpFormatter,
        filters: &[String],
    ) {
        let mut inner = self.lock();
        self.cleanup(now_unix_ns, &mut inner);
        f.open_object("OpHistory slow ops");
        f.dump_int(
            "num to keep",
            self.slow_op_size.load(Ordering::Relaxed) as i64,
        );
        f.dump_int(
            "threshold to keep",
            (self.slow_op_threshold_ns.load(Ordering::Relaxed) / NANOS_PER_SEC) as i64,
        );
        f.open_array("Ops");
        for op in inner.slow.values() {
            if !op.filter_match(filters) {
                continue;
            }
            f.open_object("Op");
            op.dump(now_unix_ns, f);
            f.close_section();
        }
        f.close_section();
        f.close_section();
    }

    fn open_history_section(&self, f: &mut dyn DumpFormatter) {
        f.open_object("op_history");
        f.dump_int("size", self.history_size.load(Ordering::Relaxed) as i64);
        f.dump_int(
            "duration",
            (self.history_duration_ns.load(Ordering::Relaxed) / NANOS_PER_SEC) as i64,
        );
    }

    /// Drop every retained op and refuse all future inserts.
    pub(crate) fn on_shutdown(&self) {
        let mut inner = self.lock();
        inner.arrived.clear();
        inner.by_duration.clear();
        inner.slow.clear();
        inner.shutdown = true;
    }

    #[cfg(test)]
    fn index_sizes(&self) -> (usize, usize, usize) {
        let inner = self.lock();
        (inner.arrived.len(), inner.by_duration.len(), inner.slow.len())
    }

    #[cfg(test)]
    fn durations_by_duration_order_secs(&self) -> Vec<u64> {
        let inner = self.lock();
        inner
            .by_duration
            .keys()
            .map(|(duration, _)| duration / NANOS_PER_SEC)
            .collect()
    }
}
