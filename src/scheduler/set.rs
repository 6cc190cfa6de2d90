//! Lazily created scheduler + runner pairs, one per model name.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::ModelRegistry;

use super::queue::{BatchConfig, BatchScheduler};
use super::runner::spawn_runner;

struct SchedulerEntry {
    scheduler: Arc<BatchScheduler>,
    _runner: JoinHandle<()>,
}

/// Owns every active scheduler. The first request for a model name
/// creates its scheduler and spawns the matching runner.
pub struct SchedulerSet {
    config: BatchConfig,
    registry: Arc<ModelRegistry>,
    shutdown: CancellationToken,
    entries: DashMap<String, SchedulerEntry>,
}

impl SchedulerSet {
    pub fn new(
        config: BatchConfig,
        registry: Arc<ModelRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
            entries: DashMap::new(),
        }
    }

    /// The scheduler for a model name, created on first use.
    pub fn scheduler_for(&self, model: &str) -> Arc<BatchScheduler> {
        let entry = self.entries.entry(model.to_string()).or_insert_with(|| {
            let scheduler = Arc::new(BatchScheduler::new(model, self.config.clone()));
            let runner = spawn_runner(
                Arc::clone(&scheduler),
                Arc::clone(&self.registry),
                self.shutdown.child_token(),
            );
            tracing::debug!(model, "scheduler created");
            SchedulerEntry {
                scheduler,
                _runner: runner,
            }
        });
        Arc::clone(&entry.scheduler)
    }

    /// Per-model total queue depths, for the status view.
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().scheduler.pending()))
            .collect()
    }

    pub fn pending_total(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.value().scheduler.pending())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;

    #[tokio::test]
    async fn scheduler_is_created_once_per_name() {
        let registry = Arc::new(ModelRegistry::new(RegistryConfig::default()));
        let set = SchedulerSet::new(
            BatchConfig::default(),
            registry,
            CancellationToken::new(),
        );

        let a = set.scheduler_for("gpt2");
        let b = set.scheduler_for("gpt2");
        let c = set.scheduler_for("other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(set.queue_depths().len(), 2);
    }
}
