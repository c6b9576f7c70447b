//! In-flight operation tracker for high-concurrency daemons.
//!
//! Producers register opaque op handles, mark events on them while working,
//! and unregister them when done; the tracker answers what is running and
//! for how long, which running ops are pathologically slow, and what
//! finished recently (slowest completions first).
//!
//! Layout:
//! - The live registry is sharded N ways so admission and release from many
//!   producer threads rarely contend; an op's shard is `seq % N`.
//! - Completed ops land in a bounded history indexed both by arrival time
//!   and by duration, plus a separate slow-op sub-history with its own
//!   bound.
//! - The slow-op check walks live ops oldest-first per shard and warns with
//!   exponential per-op backoff so one stuck op cannot flood the log.
//!
//! ```
//! use std::sync::Arc;
//! use optrack::{Clock, DumpFormatter, OpCore, OpTracker, TrackedOp, TrackerConfig};
//!
//! struct ReadOp {
//!     core: OpCore,
//!     object: String,
//! }
//!
//! impl TrackedOp for ReadOp {
//!     fn core(&self) -> &OpCore {
//!         &self.core
//!     }
//!     fn describe(&self) -> String {
//!         format!("read({})", self.object)
//!     }
//!     fn dump_type_data(&self, f: &mut dyn DumpFormatter) {
//!         f.dump_string("object", &self.object);
//!     }
//! }
//!
//! let tracker = OpTracker::new(TrackerConfig::default());
//! let op: Arc<dyn TrackedOp> = Arc::new(ReadOp {
//!     core: OpCore::new(optrack::SystemClock.now_unix_ns()),
//!     object: "rbd_data.1".to_string(),
//! });
//! assert!(tracker.register_inflight(&op));
//! op.mark_event("queued", optrack::SystemClock.now_unix_ns());
//! tracker.unregister_inflight(op);
//! tracker.shutdown();
//! ```

pub mod clock;
pub mod config;
pub mod dump;
pub mod histogram;
mod history;
pub mod op;
mod registry;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use dump::{DumpFormatter, JsonFormatter};
pub use histogram::{Pow2Histogram, Pow2HistogramSnapshot};
pub use op::{OpCore, OpEvent, OpState, TrackedOp};
pub use tracker::{OpTracker, SlowOpReport, SlowOpStats};
