//! Loader capabilities: materialize a generator from a model config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{EchoModel, EchoModelConfig, ModelError, TextGenerator};

fn default_max_seq_length() -> usize {
    2048
}

fn default_warmup_tokens() -> usize {
    16
}

/// Everything a loader needs to materialize one model version.
///
/// Two configs with identical (name, version) are considered equal;
/// everything else is advisory input to the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Semver string; parsed for ordering when the registry publishes.
    pub version: String,
    #[serde(default)]
    pub load_path: Option<PathBuf>,
    /// Free-form device hint, passed through to the loader.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub precision: Option<String>,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Tokens of dummy generation run at load time. Zero skips warm-up.
    #[serde(default = "default_warmup_tokens")]
    pub warmup_tokens: usize,
    /// Opaque bag, passed through to the loader.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            load_path: None,
            device: None,
            precision: None,
            max_seq_length: default_max_seq_length(),
            warmup_tokens: default_warmup_tokens(),
            metadata: HashMap::new(),
        }
    }
}

impl PartialEq for ModelConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for ModelConfig {}

impl std::hash::Hash for ModelConfig {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

/// Materializes a generator from a config. One loader per model name.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn TextGenerator>, ModelError>;
}

/// Built-in loader producing the deterministic echo generator.
///
/// Honors two metadata keys: `token_delay_ms` and `fail_marker`.
pub struct EchoLoader;

#[async_trait]
impl ModelLoader for EchoLoader {
    async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn TextGenerator>, ModelError> {
        let token_delay = config
            .metadata
            .get("token_delay_ms")
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    ModelError::InvalidInput(format!("bad token_delay_ms: {raw:?}"))
                })
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or_default();

        Ok(Arc::new(EchoModel::new(EchoModelConfig {
            token_delay,
            fail_marker: config.metadata.get("fail_marker").cloned(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_equality_is_name_and_version() {
        let mut a = ModelConfig::new("gpt2", "1.0.0");
        let b = ModelConfig::new("gpt2", "1.0.0");
        a.device = Some("cuda:0".into());
        a.warmup_tokens = 99;
        assert_eq!(a, b);

        let c = ModelConfig::new("gpt2", "1.0.1");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn echo_loader_rejects_bad_delay() {
        let mut config = ModelConfig::new("echo", "1.0.0");
        config
            .metadata
            .insert("token_delay_ms".into(), "soon".into());
        assert!(EchoLoader.load(&config).await.is_err());
    }
}
