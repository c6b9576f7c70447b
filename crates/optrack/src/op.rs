//! Tracked-operation handles.
//!
//! Concrete op types implement [`TrackedOp`] and embed an [`OpCore`] that
//! carries all tracker-owned state. The tracker invokes the capability
//! hooks but never constructs concrete ops.
//!
//! State model:
//! - Hot fields (seq, lifecycle state, completion stamp, warn multiplier)
//!   are atomics so registration paths never take the event lock.
//! - The event log is append-only under the per-op mutex; `current` is read
//!   by cloning the latest label so no reader ever aliases lock-protected
//!   storage.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::clock::{format_unix_ns, ns_to_secs_f64};
use crate::dump::DumpFormatter;

/// Lifecycle of a tracked op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Constructed but not yet admitted; ignored by observation paths.
    Uninitialized,
    /// Registered in the live registry.
    Live,
    /// Unregistered and owned by the completed-op history.
    History,
}

const STATE_UNINITIALIZED: u8 = 0;
const STATE_LIVE: u8 = 1;
const STATE_HISTORY: u8 = 2;

/// One entry of an op's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpEvent {
    pub stamp_unix_ns: u64,
    pub label: String,
}

/// Tracker-owned per-op state embedded in every concrete op type.
pub struct OpCore {
    seq: AtomicU64,
    initiated_unix_ns: u64,
    /// Zero until the op is unregistered.
    completed_unix_ns: AtomicU64,
    state: AtomicU8,
    warn_interval_multiplier: AtomicU32,
    events: Mutex<Vec<OpEvent>>,
}

impl OpCore {
    /// New core stamped with its initiation time, in the Uninitialized state.
    pub fn new(initiated_unix_ns: u64) -> Self {
        Self {
            seq: AtomicU64::new(0),
            initiated_unix_ns,
            completed_unix_ns: AtomicU64::new(0),
            state: AtomicU8::new(STATE_UNINITIALIZED),
            warn_interval_multiplier: AtomicU32::new(1),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Registry-assigned sequence number; zero before registration.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub(crate) fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Relaxed);
    }

    pub fn state(&self) -> OpState {
        match self.state.load(Ordering::Acquire) {
            STATE_LIVE => OpState::Live,
            STATE_HISTORY => OpState::History,
            _ => OpState::Uninitialized,
        }
    }

    pub(crate) fn set_state(&self, state: OpState) {
        let raw = match state {
            OpState::Uninitialized => STATE_UNINITIALIZED,
            OpState::Live => STATE_LIVE,
            OpState::History => STATE_HISTORY,
        };
        self.state.store(raw, Ordering::Release);
    }

    /// Short human label for the lifecycle state, used when no event has
    /// been marked yet.
    pub fn state_name(&self) -> &'static str {
        match self.state() {
            OpState::Uninitialized => "uninitialized",
            OpState::Live => "initiated",
            OpState::History => "done",
        }
    }

    pub fn initiated_unix_ns(&self) -> u64 {
        self.initiated_unix_ns
    }

    pub fn completed_unix_ns(&self) -> Option<u64> {
        match self.completed_unix_ns.load(Ordering::Acquire) {
            0 => None,
            stamp => Some(stamp),
        }
    }

    pub(crate) fn set_completed(&self, completed_unix_ns: u64) {
        self.completed_unix_ns
            .store(completed_unix_ns.max(1), Ordering::Release);
    }

    /// Age in nanoseconds at `now`.
    pub fn age_ns(&self, now_unix_ns: u64) -> u64 {
        now_unix_ns.saturating_sub(self.initiated_unix_ns)
    }

    /// Duration in nanoseconds: frozen at unregister, live age before that.
    pub fn duration_ns(&self, now_unix_ns: u64) -> u64 {
        match self.completed_unix_ns() {
            Some(completed) => completed.saturating_sub(self.initiated_unix_ns),
            None => self.age_ns(now_unix_ns),
        }
    }

    pub fn warn_interval_multiplier(&self) -> u32 {
        self.warn_interval_multiplier.load(Ordering::Relaxed)
    }

    /// Exponential backoff step; only warned-about ops are doubled.
    pub fn double_warn_interval_multiplier(&self) {
        let current = self.warn_interval_multiplier.load(Ordering::Relaxed);
        self.warn_interval_multiplier
            .store(current.saturating_mul(2), Ordering::Relaxed);
    }

    /// Label of the most recent event, cloned under the event lock.
    pub fn current(&self) -> Option<String> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.last().map(|event| event.label.clone())
    }

    /// Snapshot of the full event log.
    pub fn events(&self) -> Vec<OpEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push_event(&self, label: &str, stamp_unix_ns: u64) -> bool {
        if self.state() == OpState::Uninitialized {
            return false;
        }
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(OpEvent {
            stamp_unix_ns,
            label: label.to_string(),
        });
        true
    }
}

impl std::fmt::Debug for OpCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCore")
            .field("seq", &self.seq())
            .field("state", &self.state())
            .field("initiated_unix_ns", &self.initiated_unix_ns)
            .field("warn_interval_multiplier", &self.warn_interval_multiplier())
            .finish()
    }
}

/// Capability contract the tracker requires of any op handle.
pub trait TrackedOp: Send + Sync {
    /// The embedded tracker-owned state.
    fn core(&self) -> &OpCore;

    /// Short human description of the op.
    fn describe(&self) -> String;

    /// Write op-specific fields into an already-open object section.
    fn dump_type_data(&self, f: &mut dyn DumpFormatter);

    /// Whether the op matches a set of filter strings; an empty set matches
    /// everything.
    fn filter_match(&self, _filters: &[String]) -> bool {
        true
    }

    /// Hook invoked after an event is appended.
    fn on_event(&self, _label: &str) {}

    /// Hook invoked exactly once after removal from the live registry,
    /// before history insertion.
    fn on_unregistered(&self) {}

    /// Append `(stamp, label)` to the event log and update `current`.
    ///
    /// Ignored while the op is Uninitialized, so partially constructed
    /// handles are never observed.
    fn mark_event(&self, label: &str, stamp_unix_ns: u64) {
        if !self.core().push_event(label, stamp_unix_ns) {
            return;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                seq = self.core().seq(),
                stamp = %format_unix_ns(stamp_unix_ns),
                event = label,
                op = %self.describe(),
                "op event marked"
            );
        }
        self.on_event(label);
    }

    /// Emit the stable per-op dump schema.
    fn dump(&self, now_unix_ns: u64, f: &mut dyn DumpFormatter) {
        let core = self.core();
        if core.state() == OpState::Uninitialized {
            return;
        }
        f.dump_string("description", &self.describe());
        f.dump_stream("initiated_at", &format_unix_ns(core.initiated_unix_ns()));
        f.dump_float("age", ns_to_secs_f64(core.age_ns(now_unix_ns)));
        f.dump_float("duration", ns_to_secs_f64(core.duration_ns(now_unix_ns)));
        f.open_object("type_data");
        self.dump_type_data(f);
        f.close_section();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NANOS_PER_SEC;
    use crate::dump::JsonFormatter;

    struct PingOp {
        core: OpCore,
        target: String,
    }

    impl PingOp {
        fn new(initiated_unix_ns: u64, target: &str) -> Self {
            Self {
                core: OpCore::new(initiated_unix_ns),
                target: target.to_string(),
            }
        }
    }

    impl TrackedOp for PingOp {
        fn core(&self) -> &OpCore {
            &self.core
        }

        fn describe(&self) -> String {
            format!("ping({})", self.target)
        }

        fn dump_type_data(&self, f: &mut dyn DumpFormatter) {
            f.dump_string("target", &self.target);
        }
    }

    #[test]
    fn events_are_ignored_until_live() {
        let op = PingOp::new(NANOS_PER_SEC, "osd.3");
        op.mark_event("queued", 2 * NANOS_PER_SEC);
        assert_eq!(op.core().current(), None);

        op.core().set_state(OpState::Live);
        op.mark_event("queued", 2 * NANOS_PER_SEC);
        op.mark_event("dispatched", 3 * NANOS_PER_SEC);

        assert_eq!(op.core().current().as_deref(), Some("dispatched"));
        let events = op.core().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].label, "queued");
        assert_eq!(events[0].stamp_unix_ns, 2 * NANOS_PER_SEC);
    }

    #[test]
    fn duration_freezes_at_completion() {
        let op = PingOp::new(10 * NANOS_PER_SEC, "osd.0");
        op.core().set_state(OpState::Live);
        assert_eq!(op.core().duration_ns(14 * NANOS_PER_SEC), 4 * NANOS_PER_SEC);

        op.core().set_completed(12 * NANOS_PER_SEC);
        op.core().set_state(OpState::History);
        assert_eq!(op.core().duration_ns(100 * NANOS_PER_SEC), 2 * NANOS_PER_SEC);
        assert_eq!(op.core().age_ns(100 * NANOS_PER_SEC), 90 * NANOS_PER_SEC);
    }

    #[test]
    fn warn_multiplier_doubles_and_saturates() {
        let op = PingOp::new(0, "osd.1");
        assert_eq!(op.core().warn_interval_multiplier(), 1);
        op.core().double_warn_interval_multiplier();
        op.core().double_warn_interval_multiplier();
        assert_eq!(op.core().warn_interval_multiplier(), 4);

        for _ in 0..40 {
            op.core().double_warn_interval_multiplier();
        }
        assert_eq!(op.core().warn_interval_multiplier(), u32::MAX);
    }

    #[test]
    fn dump_emits_stable_op_schema() {
        let op = PingOp::new(5 * NANOS_PER_SEC, "osd.7");
        op.core().set_state(OpState::Live);

        let mut f = JsonFormatter::new();
        f.open_object("op");
        op.dump(9 * NANOS_PER_SEC, &mut f);
        f.close_section();

        let doc = f.into_value();
        assert_eq!(doc["op"]["description"], "ping(osd.7)");
        assert_eq!(doc["op"]["initiated_at"], "5.000000000");
        assert_eq!(doc["op"]["age"], 4.0);
        assert_eq!(doc["op"]["duration"], 4.0);
        assert_eq!(doc["op"]["type_data"]["target"], "osd.7");
    }

    #[test]
    fn uninitialized_ops_dump_nothing() {
        let op = PingOp::new(0, "osd.2");
        let mut f = JsonFormatter::new();
        f.open_object("op");
        op.dump(NANOS_PER_SEC, &mut f);
        f.close_section();

        let doc = f.into_value();
        assert_eq!(doc["op"], serde_json::json!({}));
    }
}
