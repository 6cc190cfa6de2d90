//! The admission middleware: rate limiting, request logging, and the
//! sliding-window metrics collector. The frontend runs them in that
//! order around every request.

mod logger;
mod metrics;
mod rate_limit;

pub use logger::RequestLogger;
pub use metrics::{MetricsCollector, MetricsConfig, ModelAggregates, Sample};
pub use rate_limit::{RateLimitConfig, RateLimited, RateLimiter};
