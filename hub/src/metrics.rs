use lazy_static::lazy_static;
use prometheus::{
    core::Collector, Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref INGEST_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_ingest_messages_total",
        "Total telemetry and stream messages received"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_invalid_messages_total",
        "Total messages rejected for bad shape"
    ))
    .unwrap();
    pub static ref INGEST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_ingest_failures_total",
        "Total updates that could not be written to the state store"
    ))
    .unwrap();
    pub static ref COMMITS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_commits_total",
        "Total control configurations committed"
    ))
    .unwrap();
    pub static ref COMMITS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_commits_rejected_total",
        "Total control submissions rejected by validation"
    ))
    .unwrap();
    pub static ref COMMIT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_commit_failures_total",
        "Total control submissions that failed to persist"
    ))
    .unwrap();
    pub static ref COMMIT_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hub_commit_latency_seconds",
            "Time taken to validate and commit a control configuration"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::with_opts(Opts::new(
        "hub_active_subscriptions",
        "Number of live observer subscriptions"
    ))
    .unwrap();
    pub static ref DELIVERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_deliveries_total",
        "Total values delivered to subscribers"
    ))
    .unwrap();
    pub static ref BROKEN_SUBSCRIPTIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_broken_subscriptions_total",
        "Total subscriptions torn down after a delivery failure"
    ))
    .unwrap();
    pub static ref STREAM_LIVE: Gauge = Gauge::with_opts(Opts::new(
        "hub_stream_live",
        "1 when the camera stream is live, 0 otherwise"
    ))
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(INGEST_MESSAGES_TOTAL.clone()),
        Box::new(INVALID_MESSAGES_TOTAL.clone()),
        Box::new(INGEST_FAILURES_TOTAL.clone()),
        Box::new(COMMITS_TOTAL.clone()),
        Box::new(COMMITS_REJECTED_TOTAL.clone()),
        Box::new(COMMIT_FAILURES_TOTAL.clone()),
        Box::new(COMMIT_LATENCY_SECONDS.clone()),
        Box::new(ACTIVE_SUBSCRIPTIONS.clone()),
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(BROKEN_SUBSCRIPTIONS_TOTAL.clone()),
        Box::new(STREAM_LIVE.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn set_stream_live(live: bool) {
    STREAM_LIVE.set(if live { 1.0 } else { 0.0 });
}
