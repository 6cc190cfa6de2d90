//! Fluxserve - low-latency streaming inference serving.
//!
//! Sits between many concurrent clients and a few expensive model
//! instances: HTTP requests are admitted through a middleware chain,
//! scheduled into model-sized batches by priority, and answered by
//! streaming each generated token back through a per-request bounded
//! channel.
//!
//! # Architecture
//!
//! - **stream**: per-request token channels with backpressure, plus the
//!   manager that sweeps idle ones.
//! - **registry**: versioned model publish table with warm-up, health
//!   checks, atomic hot swap, and drain-on-unload.
//! - **scheduler**: three priority queues per model and the runner loop
//!   that pulls deadline-bounded batches through the model.
//! - **middleware**: token-bucket rate limiting, request logging, and
//!   sliding-window latency/throughput metrics.
//! - **server**: the axum frontend, connection cap, and graceful
//!   shutdown coordination.
//!
//! The [`Server`] struct is the composition root: every subsystem is
//! built from one [`Config`] and passed around explicitly.

pub mod config;
pub mod middleware;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod stream;
pub mod telemetry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

pub use config::{Config, ConfigError, ServerConfig};
pub use middleware::{MetricsCollector, RateLimiter, RequestLogger};
pub use registry::{ModelRegistry, RegistryError};
pub use scheduler::SchedulerSet;
pub use server::{router, ShutdownCoordinator, ShutdownResult};
pub use stream::StreamManager;

use server::ConnectionTracker;
use stream::CloseReason;

/// The serving instance: composition root for every subsystem.
pub struct Server {
    pub config: Config,
    pub registry: Arc<ModelRegistry>,
    pub schedulers: SchedulerSet,
    pub streams: Arc<StreamManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub request_log: RequestLogger,
    pub metrics: Arc<MetricsCollector>,
    pub connections: Arc<ConnectionTracker>,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Cancels runners and sweepers once draining has finished.
    tasks: CancellationToken,
    started_at: Instant,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ModelRegistry::new(config.registry.clone()));
        let tasks = CancellationToken::new();
        let schedulers = SchedulerSet::new(
            config.batch.clone(),
            Arc::clone(&registry),
            tasks.clone(),
        );
        let streams = Arc::new(StreamManager::new(config.stream.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let connections = Arc::new(ConnectionTracker::new(config.server.max_connections));
        let shutdown = Arc::new(ShutdownCoordinator::new());

        Self {
            config,
            registry,
            schedulers,
            streams,
            rate_limiter,
            request_log: RequestLogger,
            metrics,
            connections,
            shutdown,
            tasks,
            started_at: Instant::now(),
        }
    }

    /// Start the idle sweeper, rate-limit eviction, and health monitor.
    /// The tasks run until shutdown cancels them.
    pub fn spawn_background(&self) {
        let _ = Arc::clone(&self.streams).spawn_sweeper(self.tasks.child_token());
        let _ = Arc::clone(&self.rate_limiter).spawn_sweeper(self.tasks.child_token());
        let _ = Arc::clone(&self.registry).spawn_health_monitor(self.tasks.child_token());
    }

    /// Load every model named in the config through its registered
    /// loader.
    pub async fn load_configured(&self) -> Result<(), RegistryError> {
        for model in &self.config.models {
            self.registry.load(model.clone()).await?;
        }
        Ok(())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Graceful shutdown: stop admissions, drain in-flight work within
    /// the budget, then cancel what remains and release the registry.
    pub async fn graceful_shutdown(&self) -> ShutdownResult {
        let result = self
            .shutdown
            .initiate(self.config.server.graceful_shutdown_timeout())
            .await;
        // Record the terminal reason before runners are torn down, so a
        // cancelled batch never reads as a normal end of stream.
        self.streams.close_all(CloseReason::Shutdown);
        self.tasks.cancel();
        self.registry.drain();
        result
    }
}
