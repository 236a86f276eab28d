use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Instant;

use crate::api::ErrorCode;

// User request metrics
pub static USER_REQUESTS: OnceLock<CounterVec> = OnceLock::new(); // labels: method, outcome
pub static REQUEST_REJECTIONS: OnceLock<CounterVec> = OnceLock::new(); // labels: reason
pub static REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new(); // labels: err_code

// Pending table
pub static PENDING_REQUESTS: OnceLock<Gauge> = OnceLock::new();

// Node traffic
pub static NODE_SENDS: OnceLock<CounterVec> = OnceLock::new(); // labels: outcome
pub static NODE_RESPONSES: OnceLock<CounterVec> = OnceLock::new(); // labels: outcome

// Allow-list
pub static ALLOWLIST_SIZE: OnceLock<Gauge> = OnceLock::new();
pub static ALLOWLIST_REFRESHES: OnceLock<CounterVec> = OnceLock::new(); // labels: outcome

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Times a request from registration to delivery.
#[derive(Debug)]
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn complete(self, err_code: ErrorCode) {
        if let Some(duration) = REQUEST_DURATION.get() {
            duration
                .with_label_values(&[err_code.to_string().as_str()])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

pub fn record_user_request(method: &str, outcome: &str) {
    if let Some(counter) = USER_REQUESTS.get() {
        counter.with_label_values(&[method, outcome]).inc();
    }
}

pub fn record_rejection(reason: &str) {
    if let Some(counter) = REQUEST_REJECTIONS.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn record_node_send(ok: bool) {
    if let Some(counter) = NODE_SENDS.get() {
        counter
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }
}

pub fn record_node_response(outcome: &str) {
    if let Some(counter) = NODE_RESPONSES.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn set_pending_requests(count: usize) {
    if let Some(gauge) = PENDING_REQUESTS.get() {
        gauge.set(count as f64);
    }
}

pub fn record_allowlist_refresh(size: Option<usize>) {
    match size {
        Some(size) => {
            if let Some(gauge) = ALLOWLIST_SIZE.get() {
                gauge.set(size as f64);
            }
            if let Some(counter) = ALLOWLIST_REFRESHES.get() {
                counter.with_label_values(&["ok"]).inc();
            }
        }
        None => {
            if let Some(counter) = ALLOWLIST_REFRESHES.get() {
                counter.with_label_values(&["error"]).inc();
            }
        }
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Register gateway metrics with the default registry. Safe to call more
/// than once; later calls return the first result.
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {e}")),
    }
}

fn init_metrics_internal() -> Result<()> {
    let user_requests = register_counter_vec!(
        "don_gateway_user_requests_total",
        "User requests received, by method and outcome",
        &["method", "outcome"]
    )
    .context("Failed to register USER_REQUESTS metric")?;

    let rejections = register_counter_vec!(
        "don_gateway_request_rejections_total",
        "User requests rejected before fan-out",
        &["reason"]
    )
    .context("Failed to register REQUEST_REJECTIONS metric")?;

    let request_duration = register_histogram_vec!(
        "don_gateway_request_duration_seconds",
        "Time from registration to callback delivery",
        &["err_code"]
    )
    .context("Failed to register REQUEST_DURATION metric")?;

    let pending = register_gauge!(
        "don_gateway_pending_requests",
        "Requests awaiting quorum"
    )
    .context("Failed to register PENDING_REQUESTS metric")?;

    let node_sends = register_counter_vec!(
        "don_gateway_node_sends_total",
        "Messages sent to DON members",
        &["outcome"]
    )
    .context("Failed to register NODE_SENDS metric")?;

    let node_responses = register_counter_vec!(
        "don_gateway_node_responses_total",
        "Node responses received",
        &["outcome"]
    )
    .context("Failed to register NODE_RESPONSES metric")?;

    let allowlist_size = register_gauge!(
        "don_gateway_allowlist_size",
        "Senders in the current allow-list snapshot"
    )
    .context("Failed to register ALLOWLIST_SIZE metric")?;

    let allowlist_refreshes = register_counter_vec!(
        "don_gateway_allowlist_refreshes_total",
        "Allow-list refresh attempts",
        &["outcome"]
    )
    .context("Failed to register ALLOWLIST_REFRESHES metric")?;

    let _ = USER_REQUESTS.set(user_requests);
    let _ = REQUEST_REJECTIONS.set(rejections);
    let _ = REQUEST_DURATION.set(request_duration);
    let _ = PENDING_REQUESTS.set(pending);
    let _ = NODE_SENDS.set(node_sends);
    let _ = NODE_RESPONSES.set(node_responses);
    let _ = ALLOWLIST_SIZE.set(allowlist_size);
    let _ = ALLOWLIST_REFRESHES.set(allowlist_refreshes);

    Ok(())
}
