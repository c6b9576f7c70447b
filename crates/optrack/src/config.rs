//! Tracker configuration knobs.
//!
//! Defaults suit a storage daemon health check (warn after 30s, keep the 20
//! slowest completions for 10 minutes). Every knob except `num_shards` can
//! also be changed at runtime through the tracker's setters; `OPTRACK_*`
//! environment variables override the defaults at construction the same way
//! the daemon's other subsystems take env overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Construction-time tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Number of live-registry shards; pick to match producer parallelism.
    pub num_shards: usize,
    /// When false the tracker observes nothing and all dumps bail out.
    pub tracking_enabled: bool,
    /// Minimum age before an in-flight op counts as slow.
    pub complaint_time: Duration,
    /// Maximum warnings emitted per health check.
    pub log_threshold: usize,
    /// Completed-op history cardinality bound.
    pub history_size: usize,
    /// Completed-op history age bound.
    pub history_duration: Duration,
    /// Completed ops at least this slow also enter the slow sub-history.
    pub slow_threshold: Duration,
    /// Slow sub-history cardinality bound.
    pub slow_history_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            num_shards: 32,
            tracking_enabled: true,
            complaint_time: Duration::from_secs(30),
            log_threshold: 5,
            history_size: 20,
            history_duration: Duration::from_secs(600),
            slow_threshold: Duration::from_secs(10),
            slow_history_size: 20,
        }
    }
}

impl TrackerConfig {
    /// Defaults plus any `OPTRACK_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = parse_positive_env_usize("OPTRACK_NUM_SHARDS") {
            config.num_shards = value;
        }
        if let Some(value) = parse_env_bool("OPTRACK_TRACKING_ENABLED") {
            config.tracking_enabled = value;
        }
        if let Some(value) = parse_env_duration("OPTRACK_COMPLAINT_TIME") {
            config.complaint_time = value;
        }
        if let Some(value) = parse_positive_env_usize("OPTRACK_LOG_THRESHOLD") {
            config.log_threshold = value;
        }
        if let Some(value) = parse_positive_env_usize("OPTRACK_HISTORY_SIZE") {
            config.history_size = value;
        }
        if let Some(value) = parse_env_duration("OPTRACK_HISTORY_DURATION") {
            config.history_duration = value;
        }
        if let Some(value) = parse_env_duration("OPTRACK_SLOW_THRESHOLD") {
            config.slow_threshold = value;
        }
        if let Some(value) = parse_positive_env_usize("OPTRACK_SLOW_HISTORY_SIZE") {
            config.slow_history_size = value;
        }
        config
    }
}

fn parse_positive_env_usize(var_name: &str) -> Option<usize> {
    let raw = std::env::var(var_name).ok()?;
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(env = var_name, raw = %raw, "ignoring non-positive env override");
            None
        }
    }
}

fn parse_env_bool(var_name: &str) -> Option<bool> {
    let raw = std::env::var(var_name).ok()?;
    match raw.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(env = var_name, raw = %raw, "ignoring unparseable boolean env override");
            None
        }
    }
}

fn parse_env_duration(var_name: &str) -> Option<Duration> {
    let raw = std::env::var(var_name).ok()?;
    match humantime::parse_duration(raw.trim()) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(env = var_name, raw = %raw, "ignoring unparseable duration env override");
            None
        }
    }
}
