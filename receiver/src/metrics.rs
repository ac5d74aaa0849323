use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_messages_total",
        "Total framed messages received over TCP"
    ))
    .unwrap();
    pub static ref VALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_valid_messages_total",
        "Total messages that decoded into a telemetry event"
    ))
    .unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_decode_failures_total",
        "Total messages rejected by the codec"
    ))
    .unwrap();
    pub static ref IMAGE_DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_image_decode_failures_total",
        "Total events whose embedded frame failed to decode and was omitted"
    ))
    .unwrap();
    pub static ref CONNECTIONS_ACTIVE: Gauge = Gauge::with_opts(Opts::new(
        "receiver_connections_active",
        "Currently open client connections"
    ))
    .unwrap();
    pub static ref CONNECTIONS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_connections_rejected_total",
        "Connections rejected because the connection cap was reached"
    ))
    .unwrap();
    pub static ref IDLE_TIMEOUTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_idle_timeouts_total",
        "Connections closed after the read idle timeout"
    ))
    .unwrap();
    pub static ref SINK_DROPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "receiver_sink_drops_total",
            "Events dropped from a sink queue, by sink"
        ),
        &["sink"]
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_channel_full_total",
        "Times the persistence queue was full (backpressure events)"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_db_failures_total",
        "Total database write failures (including retried attempts)"
    ))
    .unwrap();
    pub static ref DEAD_LETTER_TOTAL: Counter = Counter::with_opts(Opts::new(
        "receiver_dead_letter_total",
        "Events moved to the dead-letter log after exhausting retries"
    ))
    .unwrap();
    pub static ref PERSIST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "receiver_persist_latency_seconds",
            "Time taken to commit one event transaction"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref ACTIVE_DEVICES: Gauge = Gauge::with_opts(Opts::new(
        "receiver_active_devices",
        "Devices currently marked active in the registry"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(VALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DECODE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(IMAGE_DECODE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CONNECTIONS_REJECTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(IDLE_TIMEOUTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SINK_DROPS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEAD_LETTER_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PERSIST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ACTIVE_DEVICES.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
