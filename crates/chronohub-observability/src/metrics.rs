use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Write-behind queue
    // ============================================================================

    /// Intents waiting in the queue
    pub static ref WRITE_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "chronohub_write_queue_depth",
        "Write intents waiting to be copied to long-term storage"
    ).expect("metric can be created");

    pub static ref WRITE_QUEUE_ACCEPTED_TOTAL: IntCounter = IntCounter::new(
        "chronohub_write_queue_accepted_total",
        "Write intents accepted by the queue"
    ).expect("metric can be created");

    /// Intents dropped because the queue was full
    pub static ref WRITE_QUEUE_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "chronohub_write_queue_dropped_total",
        "Write intents dropped because the queue was full"
    ).expect("metric can be created");

    /// Outcome of each dequeued intent: written, expired, failed
    pub static ref WRITE_QUEUE_RESULTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_write_queue_results_total", "Write intent outcomes"),
        &["result"]
    ).expect("metric can be created");

    /// Time from enqueue to completed long-term write
    pub static ref WRITE_QUEUE_AGE: Histogram = Histogram::with_opts(
        HistogramOpts::new("chronohub_write_queue_age_seconds", "Time from enqueue to long-term write")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0])
    ).expect("metric can be created");

    // ============================================================================
    // Verifier
    // ============================================================================

    pub static ref VERIFIER_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_verifier_runs_total", "Verifier channel scans"),
        &["result"]
    ).expect("metric can be created");

    /// Items found in the fast tier but not in long-term single storage
    pub static ref VERIFIER_MISSING_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_verifier_missing_total", "Items resubmitted by the verifier"),
        &["channel"]
    ).expect("metric can be created");

    // ============================================================================
    // Tiers
    // ============================================================================

    /// Latency of tier operations
    pub static ref TIER_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chronohub_tier_latency_seconds", "Tier operation latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["tier", "operation"]
    ).expect("metric can be created");

    pub static ref TIER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_tier_errors_total", "Tier operation errors"),
        &["tier", "operation"]
    ).expect("metric can be created");

    /// Fan-out queries that failed closed
    pub static ref QUERY_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_query_failures_total", "Fan-out queries with a failed or timed out store"),
        &["operation"]
    ).expect("metric can be created");

    pub static ref LATEST_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "chronohub_latest_cache_hits_total",
        "Latest lookups served from the cache"
    ).expect("metric can be created");

    pub static ref LATEST_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "chronohub_latest_cache_misses_total",
        "Latest lookups that needed a backward query"
    ).expect("metric can be created");

    // ============================================================================
    // Fast tier
    // ============================================================================

    /// Items removed by the last TTL pass
    pub static ref SPOKE_EVICTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chronohub_spoke_evicted", "Items removed by the last TTL pass"),
        &["store"]
    ).expect("metric can be created");

    /// Age of the oldest item left after the last TTL pass
    pub static ref SPOKE_OLDEST_AGE_SECONDS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chronohub_spoke_oldest_age_seconds", "Age of the oldest fast tier item"),
        &["store"]
    ).expect("metric can be created");

    pub static ref RING_MEMBERS: IntGauge = IntGauge::new(
        "chronohub_ring_members",
        "Live fast tier nodes"
    ).expect("metric can be created");

    // ============================================================================
    // Batch archival
    // ============================================================================

    pub static ref BATCH_MINUTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chronohub_batch_minutes_total", "Minutes archived to batch storage"),
        &["result"]
    ).expect("metric can be created");
}

/// Registers every metric. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(WRITE_QUEUE_DEPTH.clone()))
            .expect("write_queue_depth can be registered");
        REGISTRY
            .register(Box::new(WRITE_QUEUE_ACCEPTED_TOTAL.clone()))
            .expect("write_queue_accepted_total can be registered");
        REGISTRY
            .register(Box::new(WRITE_QUEUE_DROPPED_TOTAL.clone()))
            .expect("write_queue_dropped_total can be registered");
        REGISTRY
            .register(Box::new(WRITE_QUEUE_RESULTS_TOTAL.clone()))
            .expect("write_queue_results_total can be registered");
        REGISTRY
            .register(Box::new(WRITE_QUEUE_AGE.clone()))
            .expect("write_queue_age can be registered");

        REGISTRY
            .register(Box::new(VERIFIER_RUNS_TOTAL.clone()))
            .expect("verifier_runs_total can be registered");
        REGISTRY
            .register(Box::new(VERIFIER_MISSING_TOTAL.clone()))
            .expect("verifier_missing_total can be registered");

        REGISTRY
            .register(Box::new(TIER_LATENCY.clone()))
            .expect("tier_latency can be registered");
        REGISTRY
            .register(Box::new(TIER_ERRORS_TOTAL.clone()))
            .expect("tier_errors_total can be registered");
        REGISTRY
            .register(Box::new(QUERY_FAILURES_TOTAL.clone()))
            .expect("query_failures_total can be registered");
        REGISTRY
            .register(Box::new(LATEST_CACHE_HITS_TOTAL.clone()))
            .expect("latest_cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(LATEST_CACHE_MISSES_TOTAL.clone()))
            .expect("latest_cache_misses_total can be registered");

        REGISTRY
            .register(Box::new(SPOKE_EVICTED.clone()))
            .expect("spoke_evicted can be registered");
        REGISTRY
            .register(Box::new(SPOKE_OLDEST_AGE_SECONDS.clone()))
            .expect("spoke_oldest_age_seconds can be registered");
        REGISTRY
            .register(Box::new(RING_MEMBERS.clone()))
            .expect("ring_members can be registered");

        REGISTRY
            .register(Box::new(BATCH_MINUTES_TOTAL.clone()))
            .expect("batch_minutes_total can be registered");
    });
}
