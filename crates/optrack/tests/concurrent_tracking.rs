//! Integration tests driving one tracker from many producer threads while
//! a consumer thread dumps and health-checks it, the way a daemon's worker
//! pool and admin channel share the tracker in production.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use optrack::{
    Clock, DumpFormatter, JsonFormatter, ManualClock, OpCore, OpTracker, SystemClock, TrackedOp,
    TrackerConfig,
};

struct ClientOp {
    core: OpCore,
    client: u64,
    kind: &'static str,
}

impl ClientOp {
    fn arc(now_unix_ns: u64, client: u64, kind: &'static str) -> Arc<dyn TrackedOp> {
        Arc::new(Self {
            core: OpCore::new(now_unix_ns),
            client,
            kind,
        })
    }
}

impl TrackedOp for ClientOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn describe(&self) -> String {
        format!("{}(client.{})", self.kind, self.client)
    }

    fn dump_type_data(&self, f: &mut dyn DumpFormatter) {
        f.dump_int("client", self.client as i64);
        f.dump_string("kind", self.kind);
    }

    fn filter_match(&self, filters: &[String]) -> bool {
        filters.is_empty() || filters.iter().any(|filter| self.kind.contains(filter))
    }
}

#[test]
fn many_producers_share_one_tracker() {
    const PRODUCERS: u64 = 8;
    const OPS_PER_PRODUCER: u64 = 200;

    let tracker = OpTracker::new(TrackerConfig {
        num_shards: 8,
        history_size: 50,
        ..TrackerConfig::default()
    });
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let mut producers = Vec::new();
        for client in 0..PRODUCERS {
            let tracker = &tracker;
            let clock = SystemClock;
            producers.push(scope.spawn(move || {
                for i in 0..OPS_PER_PRODUCER {
                    let kind = if i % 2 == 0 { "write" } else { "read" };
                    let op = ClientOp::arc(clock.now_unix_ns(), client, kind);
                    assert!(tracker.register_inflight(&op));
                    op.mark_event("queued", clock.now_unix_ns());
                    op.mark_event("started", clock.now_unix_ns());
                    if i % 16 == 0 {
                        std::thread::yield_now();
                    }
                    tracker.unregister_inflight(op);
                }
            }));
        }

        let observer = {
            let tracker = &tracker;
            let done = &done;
            scope.spawn(move || {
                // Concurrent observer: dumps must stay well-formed while
                // producers churn.
                while !done.load(Ordering::Relaxed) {
                    let mut f = JsonFormatter::new();
                    assert!(tracker.dump_ops_in_flight(&mut f, false, &[]));
                    let doc = f.into_value();
                    let num_ops = doc["ops_in_flight"]["num_ops"].as_i64().expect("num_ops");
                    let listed = doc["ops_in_flight"]["ops"].as_array().expect("ops").len();
                    assert_eq!(listed as i64, num_ops, "dump trailer disagrees with body");

                    let mut f = JsonFormatter::new();
                    assert!(tracker.dump_historic_ops(&mut f, true, &[]));
                    std::thread::yield_now();
                }
            })
        };

        for producer in producers {
            producer.join().expect("producer thread panicked");
        }
        done.store(true, Ordering::Relaxed);
        observer.join().expect("observer thread panicked");
    });

    // All producers unregistered everything.
    let mut f = JsonFormatter::new();
    assert!(tracker.dump_ops_in_flight(&mut f, false, &[]));
    let doc = f.into_value();
    assert_eq!(doc["ops_in_flight"]["num_ops"], 0);

    let mut f = JsonFormatter::new();
    assert!(tracker.dump_historic_ops(&mut f, false, &[]));
    let doc = f.into_value();
    let retained = doc["op_history"]["ops"].as_array().expect("ops").len();
    assert!(
        retained <= 50,
        "history size bound violated: {retained} retained"
    );

    tracker.shutdown();
}

#[test]
fn dump_schemas_and_filters_hold_through_the_public_api() {
    let clock = Arc::new(ManualClock::at_secs(1_000));
    let tracker = OpTracker::with_clock(
        TrackerConfig {
            num_shards: 2,
            history_size: 10,
            slow_threshold: Duration::from_secs(5),
            slow_history_size: 4,
            ..TrackerConfig::default()
        },
        Arc::clone(&clock) as Arc<dyn Clock>,
    );

    // Two quick reads, one slow write.
    for client in 0..2 {
        let op = ClientOp::arc(clock.now_unix_ns(), client, "read");
        assert!(tracker.register_inflight(&op));
        clock.advance(Duration::from_secs(1));
        tracker.unregister_inflight(op);
    }
    let slow = ClientOp::arc(clock.now_unix_ns(), 9, "write");
    assert!(tracker.register_inflight(&slow));
    clock.advance(Duration::from_secs(7));
    tracker.unregister_inflight(slow);

    let mut f = JsonFormatter::new();
    assert!(tracker.dump_historic_ops(&mut f, false, &[]));
    let doc = f.into_value();
    assert_eq!(doc["op_history"]["size"], 10);
    assert_eq!(doc["op_history"]["duration"], 600);
    assert_eq!(doc["op_history"]["ops"].as_array().map(Vec::len), Some(3));

    // Slowest-first ordering with the write on top.
    let mut f = JsonFormatter::new();
    assert!(tracker.dump_historic_ops(&mut f, true, &[]));
    let doc = f.into_value();
    assert_eq!(doc["op_history"]["ops"][0]["description"], "write(client.9)");
    assert_eq!(doc["op_history"]["ops"][0]["duration"], 7.0);

    // Filters prune without breaking the envelope.
    let mut f = JsonFormatter::new();
    assert!(tracker.dump_historic_ops(&mut f, false, &["write".to_string()]));
    let doc = f.into_value();
    let ops = doc["op_history"]["ops"].as_array().expect("ops");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["type_data"]["kind"], "write");

    // Legacy slow-op envelope.
    let mut f = JsonFormatter::new();
    assert!(tracker.dump_historic_slow_ops(&mut f, &[]));
    let doc = f.into_value();
    let slow_dump = &doc["OpHistory slow ops"];
    assert_eq!(slow_dump["num to keep"], 4);
    assert_eq!(slow_dump["threshold to keep"], 5);
    assert_eq!(slow_dump["Ops"].as_array().map(Vec::len), Some(1));
    assert_eq!(slow_dump["Ops"][0]["description"], "write(client.9)");

    tracker.shutdown();
}
