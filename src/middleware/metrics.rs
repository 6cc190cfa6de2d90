// Copyright 2024-2026 Fluxserve Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sliding-window request metrics, per model.
//!
//! A bounded ring of the most recent completed requests backs exact
//! percentile queries: readers copy the window under a short lock and
//! sort out-of-band, so a slow percentile computation never blocks the
//! completion path.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Metrics tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Completed requests retained per model.
    pub window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window: 1000 }
    }
}

/// One completed request.
#[derive(Debug, Clone)]
pub struct Sample {
    pub latency: Duration,
    pub tokens: u64,
    pub error: bool,
    pub completed_at: Instant,
}

/// Aggregates over one model's window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelAggregates {
    pub count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_tokens: u64,
    pub tokens_per_sec: f64,
}

pub struct MetricsCollector {
    window: usize,
    per_model: DashMap<String, VecDeque<Sample>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            window: config.window.max(1),
            per_model: DashMap::new(),
        }
    }

    /// Append one completed request, evicting the oldest beyond the
    /// window.
    pub fn record(&self, model: &str, sample: Sample) {
        let mut entry = self.per_model.entry(model.to_string()).or_default();
        let window = entry.value_mut();
        window.push_back(sample);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    /// Aggregates for one model, or `None` before its first completion.
    pub fn aggregates(&self, model: &str) -> Option<ModelAggregates> {
        let snapshot: Vec<Sample> = {
            let entry = self.per_model.get(model)?;
            entry.value().iter().cloned().collect()
        };
        Some(Self::aggregate(&snapshot))
    }

    /// Aggregates for every model seen so far.
    pub fn all(&self) -> BTreeMap<String, ModelAggregates> {
        let names: Vec<String> = self.per_model.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.aggregates(&name).map(|agg| (name, agg)))
            .collect()
    }

    pub fn sample_count(&self, model: &str) -> usize {
        self.per_model.get(model).map_or(0, |e| e.value().len())
    }

    fn aggregate(samples: &[Sample]) -> ModelAggregates {
        let count = samples.len();
        let error_count = samples.iter().filter(|s| s.error).count();
        let total_tokens: u64 = samples.iter().map(|s| s.tokens).sum();

        let mut latencies_ms: Vec<f64> = samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1000.0)
            .collect();
        latencies_ms.sort_unstable_by(|a, b| a.total_cmp(b));

        let mean = if count > 0 {
            latencies_ms.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };

        // Wall-time span of the window, for throughput. A single-sample
        // window has no span; fall back to that sample's latency.
        let span = match (
            samples.iter().map(|s| s.completed_at).min(),
            samples.iter().map(|s| s.completed_at).max(),
        ) {
            (Some(first), Some(last)) if last > first => last - first,
            _ => samples.first().map(|s| s.latency).unwrap_or_default(),
        };
        let tokens_per_sec = if span > Duration::ZERO {
            total_tokens as f64 / span.as_secs_f64()
        } else {
            0.0
        };

        ModelAggregates {
            count,
            error_count,
            error_rate: if count > 0 {
                error_count as f64 / count as f64
            } else {
                0.0
            },
            mean_latency_ms: mean,
            p50_latency_ms: percentile(&latencies_ms, 0.50),
            p95_latency_ms: percentile(&latencies_ms, 0.95),
            p99_latency_ms: percentile(&latencies_ms, 0.99),
            total_tokens,
            tokens_per_sec,
        }
    }
}

/// Exact nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
