use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref TELEMETRY_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_telemetry_total",
        "Telemetry messages decoded into device state"
    ))
    .unwrap();
    pub static ref MALFORMED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_malformed_total",
        "Telemetry messages dropped as malformed"
    ))
    .unwrap();
    pub static ref DEVICES: Gauge = Gauge::with_opts(Opts::new(
        "viewer_devices",
        "Devices currently known"
    ))
    .unwrap();
    pub static ref DEVICES_ONLINE: Gauge = Gauge::with_opts(Opts::new(
        "viewer_devices_online",
        "Devices seen within the offline threshold"
    ))
    .unwrap();
    pub static ref RETRIEVAL_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_retrieval_requests_total",
        "History requests published"
    ))
    .unwrap();
    pub static ref RETRIEVAL_COMPLETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_retrieval_completed_total",
        "History requests that finished successfully"
    ))
    .unwrap();
    pub static ref RETRIEVAL_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_retrieval_failed_total",
        "History requests that ended in failure"
    ))
    .unwrap();
    pub static ref RETRIEVAL_SUPERSEDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_retrieval_superseded_total",
        "History requests dropped for a newer one"
    ))
    .unwrap();
    pub static ref REPLIES_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "viewer_replies_rejected_total",
        "History replies refused by the reassembly state machine"
    ))
    .unwrap();
    pub static ref RETRIEVAL_BYTES: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "viewer_retrieval_bytes",
            "Size of reassembled history files"
        )
        .buckets(vec![
            1_024.0, 16_384.0, 131_072.0, 1_048_576.0, 8_388_608.0, 67_108_864.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(TELEMETRY_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(MALFORMED_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(DEVICES.clone())).unwrap();
    REGISTRY.register(Box::new(DEVICES_ONLINE.clone())).unwrap();
    REGISTRY
        .register(Box::new(RETRIEVAL_REQUESTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RETRIEVAL_COMPLETED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RETRIEVAL_FAILED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RETRIEVAL_SUPERSEDED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REPLIES_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(RETRIEVAL_BYTES.clone())).unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
