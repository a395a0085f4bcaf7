//! Prometheus metrics for the gateway.
//! Exposed at GET /metrics in text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    /// Gateway-wide registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Request latency per method/path/status.
    pub static ref HTTP_REQUESTS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "clobgate_http_request_duration_seconds",
            "HTTP request latency"
        )
        .buckets(vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "path", "status"]
    )
    .expect("http_requests histogram");

    /// Order signing latency; the hot-path budget lives here.
    pub static ref ORDER_SIGNING_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "clobgate_order_signing_latency_seconds",
            "Latency to sign EIP-712 orders"
        )
        .buckets(vec![0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01])
    )
    .expect("order_signing histogram");

    /// Pre-trade rejects by reason tag.
    pub static ref RISK_REJECTS: IntCounterVec = IntCounterVec::new(
        Opts::new("clobgate_risk_rejects_total", "Orders rejected by the risk engine"),
        &["reason"]
    )
    .expect("risk_rejects counter");

    /// Orders submitted to the exchange, by outcome.
    pub static ref ORDERS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("clobgate_orders_submitted_total", "Orders submitted to the exchange"),
        &["result"]
    )
    .expect("orders_submitted counter");

    /// Responses replayed from the idempotency store.
    pub static ref IDEMPOTENT_REPLAYS: IntCounter = IntCounter::with_opts(
        Opts::new("clobgate_idempotent_replays_total", "Requests answered from the idempotency cache")
    )
    .expect("idempotent_replays counter");

    /// Requests rejected by the per-tenant token bucket.
    pub static ref RATE_LIMITED: IntCounter = IntCounter::with_opts(
        Opts::new("clobgate_rate_limited_total", "Requests rejected by rate limiting")
    )
    .expect("rate_limited counter");

    /// WebSocket (re)connections by stream.
    pub static ref WS_RECONNECTS: IntCounterVec = IntCounterVec::new(
        Opts::new("clobgate_ws_connects_total", "WebSocket connections established"),
        &["stream"]
    )
    .expect("ws_connects counter");

    /// Audit records dropped because the sink queue was full.
    pub static ref AUDIT_DROPPED: IntCounter = IntCounter::with_opts(
        Opts::new("clobgate_audit_dropped_total", "Audit records dropped (queue full)")
    )
    .expect("audit_dropped counter");

    /// Exchange-nonce resyncs triggered by upstream nonce errors.
    pub static ref NONCE_RESYNCS: IntCounter = IntCounter::with_opts(
        Opts::new("clobgate_nonce_resyncs_total", "Exchange nonce resyncs")
    )
    .expect("nonce_resyncs counter");

    /// Panic-mode flag as a gauge (0/1) for alerting.
    pub static ref PANIC_MODE: IntGauge = IntGauge::with_opts(
        Opts::new("clobgate_panic_mode", "1 while panic mode is active")
    )
    .expect("panic_mode gauge");
}

/// Register every metric with the gateway registry. Call once at startup;
/// re-registration errors (tests, restarts) are ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS.clone()),
        Box::new(ORDER_SIGNING_LATENCY.clone()),
        Box::new(RISK_REJECTS.clone()),
        Box::new(ORDERS_SUBMITTED.clone()),
        Box::new(IDEMPOTENT_REPLAYS.clone()),
        Box::new(RATE_LIMITED.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(AUDIT_DROPPED.clone()),
        Box::new(NONCE_RESYNCS.clone()),
        Box::new(PANIC_MODE.clone()),
    ];
    for c in collectors {
        let _ = REGISTRY.register(c);
    }
}

/// Text exposition of the gateway registry.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
