//! Tracing initialization and the metrics facade.
//!
//! The sliding-window collector backs `/metrics`; the `metrics` facade
//! registered here is the export seam for external recorders.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::Deserialize;

/// Log output form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default filter directive; `RUST_LOG` overrides it.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Register metric metadata. Call once at startup.
pub fn init_metrics() {
    describe_counter!("serve_requests_total", "Requests admitted past middleware");
    describe_counter!("serve_requests_failed", "Requests that ended in error");
    describe_counter!("serve_rate_limited_total", "Requests rejected by the rate limiter");
    describe_counter!("serve_tokens_total", "Tokens streamed to clients");
    describe_counter!("serve_batches_total", "Batches dispatched to models");
    describe_counter!("serve_batches_failed", "Batches that failed atomically");

    describe_histogram!("serve_batch_latency_ms", "Wall time per dispatched batch");
    describe_histogram!("serve_batch_size", "Slots per dispatched batch");

    describe_gauge!("serve_queue_depth", "Queued requests per model");
    describe_gauge!("serve_active_connections", "Connections currently admitted");
    describe_gauge!("serve_open_streams", "Token streams currently open");
}

pub fn record_request_completed(model: &str, error: bool, tokens: u64) {
    counter!("serve_requests_total", "model" => model.to_string()).increment(1);
    if error {
        counter!("serve_requests_failed", "model" => model.to_string()).increment(1);
    }
    counter!("serve_tokens_total", "model" => model.to_string()).increment(tokens);
}

pub fn record_rate_limited(model: &str) {
    counter!("serve_rate_limited_total", "model" => model.to_string()).increment(1);
}

pub fn record_queue_depth(model: &str, depth: usize) {
    gauge!("serve_queue_depth", "model" => model.to_string()).set(depth as f64);
}

pub fn record_batch_size(model: &str, size: usize) {
    histogram!("serve_batch_size", "model" => model.to_string()).record(size as f64);
}

pub fn record_batch_success(model: &str, latency_ms: u64) {
    counter!("serve_batches_total", "model" => model.to_string()).increment(1);
    histogram!("serve_batch_latency_ms", "model" => model.to_string()).record(latency_ms as f64);
}

pub fn record_batch_failure(model: &str) {
    counter!("serve_batches_total", "model" => model.to_string()).increment(1);
    counter!("serve_batches_failed", "model" => model.to_string()).increment(1);
}

pub fn record_active_connections(count: usize) {
    gauge!("serve_active_connections").set(count as f64);
}

pub fn record_open_streams(count: usize) {
    gauge!("serve_open_streams").set(count as f64);
}
