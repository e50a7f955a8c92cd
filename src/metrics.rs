use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_operations_total", "Cache operations by result");
    let vec = IntCounterVec::new(opts, &["operation", "result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_operations_total");
    vec
});

static OPERATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "cache_operation_duration_seconds",
        "Cache operation latency",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["operation"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_operation_duration_seconds");
    vec
});

static BODY_BYTES_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_body_bytes_written_total",
        "Body bytes committed by put",
    )
    .expect("create cache_body_bytes_written_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_body_bytes_written_total");
    counter
});

static BODY_BYTES_READ_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_body_bytes_read_total", "Body bytes served by match")
        .expect("create cache_body_bytes_read_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_body_bytes_read_total");
    counter
});

static ENTRIES_DOOMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_entries_doomed_total", "Entries doomed by reason");
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_entries_doomed_total");
    vec
});

static BACKEND_CREATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_backend_creations_total", "Backend creations by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_backend_creations_total");
    vec
});

static STORE_DIR_CLEANUPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_store_dir_cleanups_total",
        "Old store directories removed after a layout upgrade",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_dir_cleanups_total");
    counter
});

static REBUILD_DISCARDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_rebuild_discarded_total",
        "Damaged entries dropped while reopening a disk store",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_rebuild_discarded_total");
    counter
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
    ]
}

pub fn record_operation(operation: &str, result: &str, elapsed: Duration) {
    OPERATIONS_TOTAL
        .with_label_values(&[operation, result])
        .inc();
    OPERATION_SECONDS
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

pub fn record_body_written(bytes: u64) {
    BODY_BYTES_WRITTEN_TOTAL.inc_by(bytes);
}

pub fn record_body_read(bytes: u64) {
    BODY_BYTES_READ_TOTAL.inc_by(bytes);
}

pub fn record_doom(reason: &str) {
    ENTRIES_DOOMED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_backend_creation(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    BACKEND_CREATIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_store_dir_cleanup() {
    STORE_DIR_CLEANUPS_TOTAL.inc();
}

pub fn record_rebuild_discarded() {
    REBUILD_DISCARDED_TOTAL.inc();
}

/// Renders every registered metric in the text exposition format.
pub fn encode() -> Result<String> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output is not UTF-8")
}
