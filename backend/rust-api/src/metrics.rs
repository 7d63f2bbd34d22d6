use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Proctoring Metrics
    pub static ref PROCTORED_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctored_sessions_total",
        "Proctored sessions by lifecycle outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref PROCTORED_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "proctored_sessions_active",
        "Number of sessions currently in the active state"
    )
    .unwrap();

    pub static ref VIOLATION_SIGNALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "violation_signals_total",
        "Detection signals seen by the aggregator",
        &["kind", "disposition"]
    )
    .unwrap();

    pub static ref SENSOR_OUTAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sensor_outages_total",
        "Detector outages (device or permission unavailable)",
        &["source"]
    )
    .unwrap();

    pub static ref SUBMISSION_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "submission_attempts_total",
        "Submission gateway calls by result",
        &["status"]
    )
    .unwrap();

    pub static ref ATTEMPTS_RECORDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_recorded_total",
        "Attempts persisted by the attempts service",
        &["termination_reason"]
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

pub fn record_session_outcome(outcome: &str) {
    PROCTORED_SESSIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_violation_signal(kind: &str, disposition: &str) {
    VIOLATION_SIGNALS_TOTAL
        .with_label_values(&[kind, disposition])
        .inc();
}
