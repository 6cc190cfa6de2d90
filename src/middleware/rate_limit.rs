//! Per-caller token-bucket rate limiting.
//!
//! Buckets start full and refill continuously at capacity/60s. Callers
//! are keyed by their supplied client id, falling back to peer address.
//! Idle buckets are evicted so adversarial id churn cannot grow the map
//! without bound.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
#[error("rate limited; retry after {retry_after_s}s")]
pub struct RateLimited {
    /// Whole seconds until one cost unit has refilled.
    pub retry_after_s: u64,
}

/// Rate-limit tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity; refill rate is capacity per minute.
    pub per_minute: f64,
    /// Cost charged per request.
    pub cost: f64,
    /// Buckets idle this long are evicted.
    pub idle_eviction_s: f64,
    /// Eviction sweep cadence.
    pub sweep_interval_s: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 10_000.0,
            cost: 1.0,
            idle_eviction_s: 600.0,
            sweep_interval_s: 60.0,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn refill_per_sec(&self) -> f64 {
        self.config.per_minute / 60.0
    }

    /// Admit or reject one request for `caller`.
    pub fn check(&self, caller: &str) -> Result<(), RateLimited> {
        self.check_at(caller, Instant::now())
    }

    /// Deterministic entry point taking an explicit clock reading.
    pub fn check_at(&self, caller: &str, now: Instant) -> Result<(), RateLimited> {
        let capacity = self.config.per_minute;
        let mut entry = self
            .buckets
            .entry(caller.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
                last_seen: now,
            });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec())
            .min(capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= self.config.cost {
            bucket.tokens -= self.config.cost;
            Ok(())
        } else {
            let deficit = self.config.cost - bucket.tokens;
            let retry_after_s = (deficit / self.refill_per_sec()).ceil() as u64;
            Err(RateLimited {
                retry_after_s: retry_after_s.max(1),
            })
        }
    }

    /// Drop buckets idle past the eviction interval.
    pub fn sweep(&self) {
        let idle = Duration::from_secs_f64(self.config.idle_eviction_s);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_seen.elapsed() <= idle);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "rate-limit sweep");
        }
    }

    pub fn tracked_callers(&self) -> usize {
        self.buckets.len()
    }

    /// Run the eviction sweeper until shutdown.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self;
        let interval = Duration::from_secs_f64(limiter.config.sweep_interval_s);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        })
    }
}
