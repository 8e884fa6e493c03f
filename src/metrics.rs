//! Prometheus metrics for the ingestion engine.
//!
//! All metrics live in a custom registry with the `estuary` prefix so the
//! crate never collides with a host process using the default registry.
//! Registration failures fall back to unregistered no-op metrics instead of
//! panicking; a warning is logged once at registration time.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::warn;

/// Custom registry for all ingestion metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("estuary".to_string()), None).unwrap_or_else(|_| Registry::new())
});

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_counter(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> =
            Lazy::new(|| register_counter_vec(&REGISTRY, $metric_name, $help, &[$($label),+]));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> =
            Lazy::new(|| register_gauge_vec(&REGISTRY, $metric_name, $help, &[$($label),+]));
    };
}

macro_rules! define_histogram {
    ($name:ident, $metric_name:expr, $help:expr, [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<Histogram> = Lazy::new(|| {
            register_histogram(&REGISTRY, $metric_name, $help, vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Conflict resolution
// =============================================================================

define_counter!(
    DCR_TOTAL,
    "conflict_resolutions_total",
    "Total conflict resolutions performed"
);
define_counter!(
    DCR_IGNORED,
    "conflict_resolutions_ignored_total",
    "Resolutions where the incoming record lost and was dropped"
);
define_counter!(
    DCR_TOMBSTONES,
    "conflict_resolution_tombstones_total",
    "Applied resolutions that produced a tombstone"
);
define_counter!(
    DUPLICATE_KEY_UPDATES,
    "duplicate_key_updates_total",
    "Applied resolutions that overwrote a key which already carried RMD"
);
define_counter!(
    OFFSET_REGRESSIONS,
    "offset_regressions_total",
    "Post-merge offset vector sums that went backwards"
);
define_counter!(
    TIMESTAMP_REGRESSIONS,
    "timestamp_regressions_total",
    "Post-merge RMD timestamps that went backwards"
);
define_counter_vec!(
    POISONED_RECORDS,
    "poisoned_records_total",
    "Records dropped as unprocessable",
    ["reason"]
);
define_counter_vec!(
    DECISION_ERRORS,
    "decision_errors_total",
    "Errors hit in the ingest loop, labelled by severity",
    ["severity"]
);
define_histogram!(
    DCR_LATENCY_SECONDS,
    "conflict_resolution_latency_seconds",
    "Latency of a single conflict resolution",
    [0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
);

// =============================================================================
// Lookups and caches
// =============================================================================

define_counter_vec!(
    LOOKUPS,
    "lookups_total",
    "Old value / RMD lookups, labelled by kind and where they were served from",
    ["kind", "source"]
);
define_histogram!(
    STORAGE_LOOKUP_LATENCY_SECONDS,
    "storage_lookup_latency_seconds",
    "Latency of storage-engine reads in the ingest loop",
    [0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
);

// =============================================================================
// Produce pipeline
// =============================================================================

define_counter_vec!(
    VT_PRODUCES,
    "version_topic_produces_total",
    "Records produced to the local version topic",
    ["kind"]
);
define_counter!(
    VIEW_FANOUTS,
    "view_fanouts_total",
    "Records fanned out to derived view streams"
);
define_histogram!(
    VIEW_FANOUT_LATENCY_SECONDS,
    "view_fanout_latency_seconds",
    "Time to get all view-stream acknowledgements for a record",
    [0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
);

// =============================================================================
// Subscriptions, topic switches and repair
// =============================================================================

define_counter_vec!(
    TOPIC_SWITCHES,
    "topic_switches_total",
    "Topic switch executions",
    ["outcome"]
);
define_counter_vec!(
    REPAIR_TASKS,
    "repair_tasks_total",
    "Remote ingestion repair task transitions",
    ["outcome"]
);
define_counter_vec!(
    REGION_HEALTH_ALARMS,
    "region_health_alarms_total",
    "Escalations after repeated repair failures",
    ["region"]
);
define_counter!(
    INGESTION_FAILURES,
    "ingestion_failures_total",
    "Failures while contacting brokers during subscription management"
);
define_gauge_vec!(
    READY_TO_SERVE_LAG,
    "ready_to_serve_lag",
    "Per-partition readiness lag against the configured threshold",
    ["partition"]
);

// =============================================================================
// Safe registration helpers
// =============================================================================

fn register_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|_| IntCounter::new("noop", "noop").unwrap());
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    counter
}

fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|_| IntCounterVec::new(Opts::new("noop", "noop"), &["l"]).unwrap());
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    counter
}

fn register_gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|_| IntGaugeVec::new(Opts::new("noop", "noop"), &["l"]).unwrap());
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    gauge
}

fn register_histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .unwrap_or_else(|_| Histogram::with_opts(HistogramOpts::new("noop", "noop")).unwrap());
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    histogram
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_resolution(ignored: bool, tombstone: bool, duplicate_key: bool, latency_secs: f64) {
    DCR_TOTAL.inc();
    if ignored {
        DCR_IGNORED.inc();
    }
    if tombstone {
        DCR_TOMBSTONES.inc();
    }
    if duplicate_key {
        DUPLICATE_KEY_UPDATES.inc();
    }
    DCR_LATENCY_SECONDS.observe(latency_secs);
}

pub fn record_lookup(kind: &str, cache_hit: bool) {
    let source = if cache_hit { "transient_cache" } else { "storage" };
    LOOKUPS.with_label_values(&[kind, source]).inc();
}

pub fn record_poisoned_record(reason: &str) {
    POISONED_RECORDS.with_label_values(&[reason]).inc();
}

pub fn record_decision_error(severity: &str) {
    DECISION_ERRORS.with_label_values(&[severity]).inc();
}

pub fn record_vt_produce(kind: &str) {
    VT_PRODUCES.with_label_values(&[kind]).inc();
}

pub fn record_view_fanout(latency_secs: f64) {
    VIEW_FANOUTS.inc();
    VIEW_FANOUT_LATENCY_SECONDS.observe(latency_secs);
}

pub fn record_topic_switch(outcome: &str) {
    TOPIC_SWITCHES.with_label_values(&[outcome]).inc();
}

pub fn record_repair_task(outcome: &str) {
    REPAIR_TASKS.with_label_values(&[outcome]).inc();
}

pub fn record_region_health_alarm(region: &str) {
    REGION_HEALTH_ALARMS.with_label_values(&[region]).inc();
}

pub fn set_ready_to_serve_lag(partition: u32, lag: i64) {
    READY_TO_SERVE_LAG
        .with_label_values(&[&partition.to_string()])
        .set(lag);
}
