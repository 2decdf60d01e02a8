//! Captured log entries, metric samples, and resource samples.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::severity::Severity;

/// Reserved metric name prefixes. `sub_*` counters are tier-computed and
/// `msg_*` counters come from the severity tallies; user metrics may not
/// shadow either namespace.
pub const RESERVED_METRIC_PREFIXES: [&str; 2] = ["sub_", "msg_"];

/// Snapshot of named integer metrics, keyed by metric name.
pub type MetricMap = BTreeMap<String, i64>;

/// A single captured log line. `uid` is assigned by the local store and is
/// not preserved across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub uid: i64,
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

/// Last-write-wins named integer metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: i64,
    pub timestamp: i64,
}

/// One reading of a supervised process's resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub rss_bytes: i64,
}

/// Whether a metric name is reserved for runtime-computed counters.
pub fn is_reserved_metric(name: &str) -> bool {
    RESERVED_METRIC_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Element-wise add `from` into `into`.
pub fn merge_metrics(into: &mut MetricMap, from: &MetricMap) {
    for (name, value) in from {
        *into.entry(name.clone()).or_insert(0) += value;
    }
}
