//! Load generator for exercising the optrack operation tracker.
//!
//! Spawns producer threads that register ops with randomized hold times
//! (plus a configurable fraction of stuck ops), runs a health loop that
//! logs slow-op summaries the way a daemon's periodic check would, and
//! finally prints the in-flight, historic, and slow-op dumps as JSON.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use optrack::{
    Clock, DumpFormatter, JsonFormatter, OpCore, OpTracker, SystemClock, TrackedOp, TrackerConfig,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "optrack-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of producer threads.
    #[arg(long, env = "OPTRACK_WL_PRODUCERS", default_value_t = 8)]
    producers: usize,

    /// Operations issued per producer thread.
    #[arg(long, env = "OPTRACK_WL_OPS", default_value_t = 200)]
    ops: usize,

    /// Live-registry shard count.
    #[arg(long, env = "OPTRACK_NUM_SHARDS", default_value_t = 8)]
    shards: usize,

    /// Longest normal op hold time; holds are sampled uniformly below it.
    #[arg(long, default_value = "20ms")]
    max_hold: humantime::Duration,

    /// Percent of ops that get stuck for `stuck_hold` instead.
    #[arg(long, default_value_t = 2)]
    stuck_pct: u8,

    /// Hold time for stuck ops; pick it above the complaint time to see
    /// slow-op warnings.
    #[arg(long, default_value = "3s")]
    stuck_hold: humantime::Duration,

    /// Minimum age before an in-flight op counts as slow.
    #[arg(long, env = "OPTRACK_COMPLAINT_TIME", default_value = "1s")]
    complaint_time: humantime::Duration,

    /// Maximum warnings logged per health check.
    #[arg(long, env = "OPTRACK_LOG_THRESHOLD", default_value_t = 5)]
    log_threshold: usize,

    /// Completed-op history cardinality bound.
    #[arg(long, env = "OPTRACK_HISTORY_SIZE", default_value_t = 20)]
    history_size: usize,

    /// Completed ops at least this slow enter the slow sub-history.
    #[arg(long, env = "OPTRACK_SLOW_THRESHOLD", default_value = "2s")]
    slow_threshold: humantime::Duration,

    /// Health-check cadence.
    #[arg(long, default_value = "500ms")]
    check_interval: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the final dumps to this path instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// One generated unit of work.
struct WorkloadOp {
    core: OpCore,
    producer: usize,
    index: usize,
    kind: &'static str,
}

impl WorkloadOp {
    fn arc(producer: usize, index: usize, kind: &'static str) -> Arc<dyn TrackedOp> {
        Arc::new(Self {
            core: OpCore::new(SystemClock.now_unix_ns()),
            producer,
            index,
            kind,
        })
    }
}

impl TrackedOp for WorkloadOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn describe(&self) -> String {
        format!("{}(producer.{} op.{})", self.kind, self.producer, self.index)
    }

    fn dump_type_data(&self, f: &mut dyn DumpFormatter) {
        f.dump_int("producer", self.producer as i64);
        f.dump_int("index", self.index as i64);
        f.dump_string("kind", self.kind);
    }

    fn filter_match(&self, filters: &[String]) -> bool {
        filters.is_empty() || filters.iter().any(|filter| self.kind.contains(filter))
    }
}

/// Parse CLI args, initialize logging, and run the requested subcommand.
fn main() -> anyhow::Result<()> {
    use std::io::IsTerminal;

    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run_workload(args),
    }
}

fn run_workload(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        SystemClock.now_unix_ns()
    } else {
        args.seed
    };
    tracing::info!(
        producers = args.producers,
        ops = args.ops,
        shards = args.shards,
        seed,
        "starting workload"
    );

    let tracker = OpTracker::new(TrackerConfig {
        num_shards: args.shards.max(1),
        complaint_time: args.complaint_time.into(),
        log_threshold: args.log_threshold,
        history_size: args.history_size,
        slow_threshold: args.slow_threshold.into(),
        ..TrackerConfig::from_env()
    });
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let mut producers = Vec::new();
        for producer in 0..args.producers {
            let tracker = &tracker;
            let run = &args;
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(producer as u64));
            producers.push(scope.spawn(move || {
                for index in 0..run.ops {
                    let stuck = rng.gen_range(0..100u8) < run.stuck_pct;
                    let kind = if stuck { "stuck" } else { "io" };
                    let op = WorkloadOp::arc(producer, index, kind);
                    if !tracker.register_inflight(&op) {
                        continue;
                    }
                    op.mark_event("queued", SystemClock.now_unix_ns());
                    let hold = if stuck {
                        *run.stuck_hold
                    } else {
                        let max_ns = run.max_hold.as_nanos().max(1).min(u128::from(u64::MAX));
                        Duration::from_nanos(rng.gen_range(0..max_ns as u64))
                    };
                    std::thread::sleep(hold);
                    op.mark_event("finishing", SystemClock.now_unix_ns());
                    tracker.unregister_inflight(op);
                }
            }));
        }

        let checker = {
            let tracker = &tracker;
            let done = &done;
            let interval: Duration = args.check_interval.into();
            scope.spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if let Some(report) = tracker.check_ops_in_flight() {
                        tracing::warn!(num_slow = report.num_slow, "{}", report.summary);
                        for line in &report.warnings {
                            tracing::warn!("{line}");
                        }
                    }
                    std::thread::sleep(interval);
                }
            })
        };

        for producer in producers {
            if producer.join().is_err() {
                tracing::error!("producer thread panicked");
            }
        }
        done.store(true, Ordering::Relaxed);
        let _ = checker.join();
    });

    let report = final_dumps(&tracker)?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, &report)
                .with_context(|| format!("write workload report to {}", path.display()))?;
            tracing::info!(path = %path.display(), "workload report written");
        }
        None => println!("{report}"),
    }

    tracker.shutdown();
    Ok(())
}

/// Collect the in-flight, historic, and slow-op dumps into one document.
fn final_dumps(tracker: &OpTracker) -> anyhow::Result<String> {
    let mut f = JsonFormatter::new();
    tracker.dump_ops_in_flight(&mut f, false, &[]);
    tracker.dump_historic_ops(&mut f, true, &[]);
    let in_flight_and_history = f.into_value();

    let mut f = JsonFormatter::new();
    tracker.dump_historic_slow_ops(&mut f, &[]);
    let slow = f.into_value();

    let mut h = optrack::Pow2Histogram::new();
    tracker.get_age_ms_histogram(&mut h);

    let document = serde_json::json!({
        "in_flight": in_flight_and_history["ops_in_flight"],
        "op_history": in_flight_and_history["op_history"],
        "slow_ops": slow["OpHistory slow ops"],
        "age_ms_histogram": h.snapshot(),
    });
    serde_json::to_string_pretty(&document).context("serialize workload report")
}
