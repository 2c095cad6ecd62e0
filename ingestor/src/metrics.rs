use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_decode_failures_total",
        "Total messages dropped because the payload could not be decoded"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_invalid_messages_total",
            "Total messages rejected by validation, by offending field"
        ),
        &["field"]
    )
    .unwrap();
    pub static ref REGISTRY_REJECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_registry_rejects_total",
        "Total messages dropped because the device is not registered"
    ))
    .unwrap();
    pub static ref DEVICES_AUTO_REGISTERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_devices_auto_registered_total",
        "Total unseen devices created as unclaimed"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_persisted_total",
        "Total readings written to storage"
    ))
    .unwrap();
    pub static ref READINGS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_dropped_total",
        "Total accepted readings lost to storage failures"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total transient database failures and timeouts"
    ))
    .unwrap();
    pub static ref CLAIM_CONFLICTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_claim_conflicts_total",
        "Total claims refused because another owner holds the device"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to flush a batch of readings into storage"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Size of the last batch flushed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times a worker channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECODE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REGISTRY_REJECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_AUTO_REGISTERED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_PERSISTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CLAIM_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
