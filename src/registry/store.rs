//! The model registry: versioned publish table with hot swap.
//!
//! Load, unload, and version switches are serialized per model name;
//! lookups take a short read lock and clone the published Arc, so
//! readers never wait on a load in progress. Unload removes the entry
//! from the table while in-flight work keeps the model alive through
//! its Arc; the generator's cleanup hook runs when the last reference
//! drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{DiscardSink, GenerateParams, TextGenerator};

use super::history::{ActivationSource, VersionHistory};
use super::loader::{ModelConfig, ModelLoader};
use super::version::{ModelVersion, VersionError};

/// Prompt used for warm-up generation; the output is discarded.
const WARMUP_PROMPT: &str = "warm up the caches";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Loader already registered for model: {0}")]
    LoaderExists(String),

    #[error("No loader registered for model: {0}")]
    NoLoader(String),

    #[error("Model already loaded: {name} {version}")]
    AlreadyLoaded { name: String, version: ModelVersion },

    #[error("Load failed for {name} {version}: {message}")]
    LoadFailed {
        name: String,
        version: ModelVersion,
        message: String,
    },

    #[error("Warm-up failed for {name} {version}: {message}")]
    WarmupFailed {
        name: String,
        version: ModelVersion,
        message: String,
    },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown version {version} for model {name}")]
    UnknownVersion { name: String, version: ModelVersion },

    #[error("Version {version} is active for model {name}; switch versions first")]
    ActiveVersion { name: String, version: ModelVersion },

    #[error("No previous version to roll back to for model {0}")]
    NoRollbackTarget(String),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Registry tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Background health probe cadence.
    pub health_interval_s: f64,
    /// Consecutive probe failures before an entry is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval_s: 30.0,
            unhealthy_threshold: 3,
        }
    }
}

/// Per-model lifetime counters.
#[derive(Debug, Default)]
pub struct ModelStats {
    requests: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
}

impl ModelStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, n: u64) {
        self.tokens.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModelStatsSnapshot {
        ModelStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub tokens: u64,
}

/// A published model version. Owned by the registry; in-flight batches
/// hold an Arc for the duration of their work.
pub struct LoadedModel {
    pub config: ModelConfig,
    pub version: ModelVersion,
    generator: Arc<dyn TextGenerator>,
    pub loaded_at: SystemTime,
    last_health_ok: RwLock<Option<SystemTime>>,
    health_failures: AtomicU32,
    unhealthy: AtomicBool,
    pub stats: ModelStats,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("config", &self.config)
            .field("version", &self.version)
            .field("loaded_at", &self.loaded_at)
            .field("unhealthy", &self.unhealthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoadedModel {
    pub fn generator(&self) -> &dyn TextGenerator {
        self.generator.as_ref()
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Acquire)
    }

    pub fn last_health_ok(&self) -> Option<SystemTime> {
        *self.last_health_ok.read()
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        self.generator.cleanup();
        tracing::debug!(model = %self.config.name, version = %self.version, "model released");
    }
}

struct ModelEntry {
    versions: HashMap<ModelVersion, Arc<LoadedModel>>,
    active: ModelVersion,
    history: VersionHistory,
}

pub struct ModelRegistry {
    config: RegistryConfig,
    loaders: RwLock<HashMap<String, Arc<dyn ModelLoader>>>,
    entries: RwLock<HashMap<String, ModelEntry>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            loaders: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store the loader capability for a model name.
    pub fn register_loader(
        &self,
        name: &str,
        loader: Arc<dyn ModelLoader>,
        replace: bool,
    ) -> Result<(), RegistryError> {
        let mut loaders = self.loaders.write();
        if loaders.contains_key(name) && !replace {
            return Err(RegistryError::LoaderExists(name.to_string()));
        }
        loaders.insert(name.to_string(), loader);
        Ok(())
    }

    /// Serialize load/unload/switch per model name without holding the
    /// publish table across awaits.
    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.op_locks
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Load and publish one model version: loader, warm-up, initial health
    /// probe, then atomic publish. First load of a name becomes active.
    pub async fn load(&self, config: ModelConfig) -> Result<Arc<LoadedModel>, RegistryError> {
        let version = ModelVersion::parse(&config.version)?;
        let name = config.name.clone();
        let op = self.op_lock(&name);
        let _serialized = op.lock().await;

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&name) {
                if entry.versions.contains_key(&version) {
                    return Err(RegistryError::AlreadyLoaded { name, version });
                }
            }
        }

        let loader = self
            .loaders
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| RegistryError::NoLoader(name.clone()))?;

        let generator =
            loader
                .load(&config)
                .await
                .map_err(|e| RegistryError::LoadFailed {
                    name: name.clone(),
                    version: version.clone(),
                    message: e.to_string(),
                })?;

        self.warm_up(&config, &version, generator.as_ref()).await?;
        let initially_healthy = generator.health_check().await;

        let loaded = Arc::new(LoadedModel {
            config,
            version: version.clone(),
            generator,
            loaded_at: SystemTime::now(),
            last_health_ok: RwLock::new(initially_healthy.then(SystemTime::now)),
            health_failures: AtomicU32::new(0),
            unhealthy: AtomicBool::new(false),
            stats: ModelStats::default(),
        });

        let mut entries = self.entries.write();
        match entries.get_mut(&name) {
            Some(entry) => {
                entry.versions.insert(version.clone(), Arc::clone(&loaded));
            }
            None => {
                let mut history = VersionHistory::new();
                history.record(version.clone(), ActivationSource::Initial);
                let mut versions = HashMap::new();
                versions.insert(version.clone(), Arc::clone(&loaded));
                entries.insert(
                    name.clone(),
                    ModelEntry {
                        versions,
                        active: version.clone(),
                        history,
                    },
                );
            }
        }
        drop(entries);

        tracing::info!(model = %name, %version, "model loaded");
        Ok(loaded)
    }

    async fn warm_up(
        &self,
        config: &ModelConfig,
        version: &ModelVersion,
        generator: &dyn TextGenerator,
    ) -> Result<(), RegistryError> {
        if config.warmup_tokens == 0 {
            return Ok(());
        }
        let params = GenerateParams {
            max_tokens: config.warmup_tokens,
            temperature: 0.0,
        };
        generator
            .generate(WARMUP_PROMPT, &params, &DiscardSink)
            .await
            .map_err(|e| RegistryError::WarmupFailed {
                name: config.name.clone(),
                version: version.clone(),
                message: e.to_string(),
            })
    }

    /// Atomically switch which version lookups return. In-flight work on
    /// the old version is undisturbed.
    pub async fn set_active_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(), RegistryError> {
        let version = ModelVersion::parse(version)?;
        let op = self.op_lock(name);
        let _serialized = op.lock().await;

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        if !entry.versions.contains_key(&version) {
            return Err(RegistryError::UnknownVersion {
                name: name.to_string(),
                version,
            });
        }
        if entry.active != version {
            entry.active = version.clone();
            entry.history.record(version.clone(), ActivationSource::HotSwap);
            tracing::info!(model = name, %version, "active version switched");
        }
        Ok(())
    }

    /// Revert to the previously active version, if it is still loaded.
    pub async fn rollback(&self, name: &str) -> Result<ModelVersion, RegistryError> {
        let op = self.op_lock(name);
        let _serialized = op.lock().await;

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        let target = entry
            .history
            .previous()
            .map(|e| e.version.clone())
            .ok_or_else(|| RegistryError::NoRollbackTarget(name.to_string()))?;
        if !entry.versions.contains_key(&target) {
            return Err(RegistryError::UnknownVersion {
                name: name.to_string(),
                version: target,
            });
        }
        entry.active = target.clone();
        entry.history.record(target.clone(), ActivationSource::Rollback);
        tracing::info!(model = name, version = %target, "rolled back");
        Ok(target)
    }

    /// The currently active version for a name.
    pub fn lookup(&self, name: &str) -> Result<Arc<LoadedModel>, RegistryError> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        entry
            .versions
            .get(&entry.active)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownVersion {
                name: name.to_string(),
                version: entry.active.clone(),
            })
    }

    /// A specific published version.
    pub fn lookup_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<LoadedModel>, RegistryError> {
        let version = ModelVersion::parse(version)?;
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        entry
            .versions
            .get(&version)
            .cloned()
            .ok_or(RegistryError::UnknownVersion {
                name: name.to_string(),
                version,
            })
    }

    /// Withdraw a version from the publish table. New lookups fail at
    /// once; in-flight references drain naturally. The active version can
    /// only be unloaded when it is the last one, which retires the name.
    pub async fn unload(&self, name: &str, version: &str) -> Result<(), RegistryError> {
        let version = ModelVersion::parse(version)?;
        let op = self.op_lock(name);
        let _serialized = op.lock().await;

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        if !entry.versions.contains_key(&version) {
            return Err(RegistryError::UnknownVersion {
                name: name.to_string(),
                version,
            });
        }
        if entry.active == version {
            if entry.versions.len() > 1 {
                return Err(RegistryError::ActiveVersion {
                    name: name.to_string(),
                    version,
                });
            }
            entries.remove(name);
        } else {
            entry.versions.remove(&version);
        }
        tracing::info!(model = name, %version, "model unloaded");
        Ok(())
    }

    /// Probe every published version once. Success refreshes
    /// last-health-ok; repeated failures mark the entry unhealthy without
    /// unloading it.
    pub async fn health_check_all(&self) {
        let snapshot: Vec<(String, Arc<LoadedModel>)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .flat_map(|(name, entry)| {
                    entry
                        .versions
                        .values()
                        .map(|m| (name.clone(), Arc::clone(m)))
                })
                .collect()
        };

        for (name, model) in snapshot {
            if model.generator.health_check().await {
                *model.last_health_ok.write() = Some(SystemTime::now());
                model.health_failures.store(0, Ordering::Release);
                model.unhealthy.store(false, Ordering::Release);
            } else {
                let failures = model.health_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.unhealthy_threshold {
                    if !model.unhealthy.swap(true, Ordering::AcqRel) {
                        tracing::warn!(
                            model = %name,
                            version = %model.version,
                            failures,
                            "model marked unhealthy"
                        );
                    }
                }
            }
        }
    }

    /// Run periodic health checks until shutdown.
    pub fn spawn_health_monitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self;
        let interval = Duration::from_secs_f64(registry.config.health_interval_s);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        tracing::debug!("health monitor: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => registry.health_check_all().await,
                }
            }
        })
    }

    /// Everything published, for `/models` and `/status`.
    pub fn list(&self) -> Vec<ModelSummary> {
        let entries = self.entries.read();
        let mut summaries: Vec<ModelSummary> = entries
            .iter()
            .map(|(name, entry)| {
                let mut versions: Vec<VersionSummary> = entry
                    .versions
                    .values()
                    .map(|m| VersionSummary {
                        version: m.version.clone(),
                        loaded_at: format_system_time(m.loaded_at),
                        healthy: m.is_healthy(),
                        last_health_ok: m.last_health_ok().map(format_system_time),
                        stats: m.stats.snapshot(),
                    })
                    .collect();
                versions.sort_by(|a, b| a.version.cmp(&b.version));
                ModelSummary {
                    name: name.clone(),
                    active: entry.active.clone(),
                    versions,
                    history: entry.history.clone(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Drop every published reference. Shutdown path: cleanup hooks run
    /// as the last in-flight references release.
    pub fn drain(&self) {
        self.entries.write().clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub active: ModelVersion,
    pub versions: Vec<VersionSummary>,
    pub history: VersionHistory,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub version: ModelVersion,
    pub loaded_at: String,
    pub healthy: bool,
    pub last_health_ok: Option<String>,
    pub stats: ModelStatsSnapshot,
}

/// ISO 8601 rendering for status payloads.
fn format_system_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}
