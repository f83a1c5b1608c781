/// Metrics Module - Prometheus Instrumentation
///
/// Grounded on the teacher's `metrics.rs`: a single `prometheus::Registry`,
/// `lazy_static` metric definitions, and a small helper API so call sites
/// never touch the `prometheus` crate directly.
///
/// Spec §6 calls out two counters by name (`indexed_blocks`,
/// `chain_reorg_events_total`); the rest give the pipeline described in
/// §4.5-§4.8 basic observability (worker concurrency, commit latency, poison
/// blocks, sync height). This module does not bind an HTTP listener for
/// `/metrics` — exposing the registry is the excluded "metrics exporter"
/// collaborator's job (spec §1).
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total blocks committed to the Store (spec §6).
    pub static ref INDEXED_BLOCKS: IntCounter = IntCounter::new(
        "indexer_indexed_blocks_total",
        "Total blocks committed to the store"
    ).unwrap();

    /// Total chain reorganization events handled (spec §6).
    pub static ref CHAIN_REORG_EVENTS: IntCounter = IntCounter::new(
        "indexer_chain_reorg_events_total",
        "Total chain reorganization events handled"
    ).unwrap();

    /// Blocks processed by pipeline stage (fetch, parse, commit).
    pub static ref BLOCKS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_blocks_processed_total", "Blocks processed by stage"),
        &["stage"]
    ).unwrap();

    /// Current node tip height vs. store height.
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("indexer_chain_tip_height", "Chain tip height by source"),
        &["source"]
    ).unwrap();

    /// Projector commit duration.
    pub static ref COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("indexer_commit_duration_seconds", "Projector commit latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// NodeClient request duration.
    pub static ref NODE_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("indexer_node_request_duration_seconds", "NodeClient request latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["endpoint"]
    ).unwrap();

    /// Store write errors.
    pub static ref STORE_ERRORS: IntCounter = IntCounter::new(
        "indexer_store_errors_total",
        "Store transaction failures"
    ).unwrap();

    /// NodeClient errors by kind (unavailable, not_found, bad_request).
    pub static ref NODE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_node_errors_total", "NodeClient errors by kind"),
        &["kind"]
    ).unwrap();

    /// Blocks flagged poisoned (unrecoverable after retry).
    pub static ref POISON_BLOCKS: IntCounter = IntCounter::new(
        "indexer_poison_blocks_total",
        "Blocks that failed projection after max_block_retries"
    ).unwrap();

    /// Current WorkPool concurrency.
    pub static ref WORKPOOL_CONCURRENCY: IntGauge = IntGauge::new(
        "indexer_workpool_concurrency",
        "Current WorkPool target concurrency (W)"
    ).unwrap();

    /// Cache hit/miss counters.
    pub static ref CACHE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_cache_hits_total", "Cache hits by kind"),
        &["kind"]
    ).unwrap();
    pub static ref CACHE_MISSES: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_cache_misses_total", "Cache misses by kind"),
        &["kind"]
    ).unwrap();
}

/// Register every metric with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(INDEXED_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(CHAIN_REORG_EVENTS.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(COMMIT_DURATION.clone()))?;
    REGISTRY.register(Box::new(NODE_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(STORE_ERRORS.clone()))?;
    REGISTRY.register(Box::new(NODE_ERRORS.clone()))?;
    REGISTRY.register(Box::new(POISON_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(WORKPOOL_CONCURRENCY.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES.clone()))?;
    Ok(())
}

/// Render the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Simple wall-clock timer for histogram observations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn record_block_committed() {
    INDEXED_BLOCKS.inc();
}

pub fn record_reorg_event() {
    CHAIN_REORG_EVENTS.inc();
}

pub fn increment_blocks_processed(stage: &str, count: u64) {
    BLOCKS_PROCESSED.with_label_values(&[stage]).inc_by(count);
}

pub fn set_chain_tip_height(source: &str, height: i64) {
    CHAIN_TIP_HEIGHT.with_label_values(&[source]).set(height);
}

pub fn record_commit_duration(secs: f64) {
    COMMIT_DURATION.observe(secs);
}

pub fn record_node_request_duration(endpoint: &str, secs: f64) {
    NODE_REQUEST_DURATION.with_label_values(&[endpoint]).observe(secs);
}

pub fn record_store_error() {
    STORE_ERRORS.inc();
}

pub fn record_node_error(kind: &str) {
    NODE_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_poison_block() {
    POISON_BLOCKS.inc();
}

pub fn set_workpool_concurrency(w: i64) {
    WORKPOOL_CONCURRENCY.set(w);
}

pub fn record_cache_hit(kind: &str) {
    CACHE_HITS.with_label_values(&[kind]).inc();
}

pub fn record_cache_miss(kind: &str) {
    CACHE_MISSES.with_label_values(&[kind]).inc();
}
