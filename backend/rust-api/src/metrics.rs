use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
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

    // Quiz Metrics
    pub static ref ATTEMPTS_STARTED_TOTAL: IntCounter = register_int_counter!(
        "quiz_attempts_started_total",
        "Total number of quiz attempts started"
    )
    .unwrap();

    pub static ref ATTEMPTS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_attempts_finished_total",
        "Total number of quiz attempts leaving in_progress",
        &["status"]
    )
    .unwrap();

    pub static ref ANSWERS_GRADED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_graded_total",
        "Total number of answers graded",
        &["outcome"]
    )
    .unwrap();

    // Commerce Metrics
    pub static ref PROMOTION_REDEMPTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "promotion_redemptions_total",
        "Total number of promotion redemption attempts",
        &["result"]
    )
    .unwrap();

    pub static ref PAYMENTS_SETTLED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payments_settled_total",
        "Total number of payments settled",
        &["business_type"]
    )
    .unwrap();

    pub static ref CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "write_conflicts_total",
        "Conditional writes lost to a concurrent writer",
        &["aggregate"]
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

pub fn record_answer_graded(correct: Option<bool>) {
    let outcome = match correct {
        Some(true) => "correct",
        Some(false) => "incorrect",
        None => "pending_review",
    };
    ANSWERS_GRADED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_conflict(aggregate: &str) {
    CONFLICTS_TOTAL.with_label_values(&[aggregate]).inc();
}
