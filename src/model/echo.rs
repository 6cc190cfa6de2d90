//! Deterministic built-in generator.
//!
//! Echoes the prompt back one word per token with synthetic ids. Serves
//! as the default loader target so the binary runs end-to-end without a
//! real backend, and as the workhorse of the test suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{GenerateParams, ModelError, StreamToken, TextGenerator, TokenSink};

/// Behavior knobs for [`EchoModel`].
#[derive(Debug, Clone, Default)]
pub struct EchoModelConfig {
    /// Delay between emitted tokens. Zero by default.
    pub token_delay: Duration,
    /// Prompts containing this marker fail generation. Test hook for the
    /// batch-atomic error path.
    pub fail_marker: Option<String>,
}

pub struct EchoModel {
    config: EchoModelConfig,
    healthy: AtomicBool,
}

impl EchoModel {
    pub fn new(config: EchoModelConfig) -> Self {
        Self {
            config,
            healthy: AtomicBool::new(true),
        }
    }

    /// Flip the health probe outcome. Test hook.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new(EchoModelConfig::default())
    }
}

#[async_trait]
impl TextGenerator for EchoModel {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        sink: &dyn TokenSink,
    ) -> Result<(), ModelError> {
        if let Some(marker) = &self.config.fail_marker {
            if prompt.contains(marker.as_str()) {
                return Err(ModelError::Generation(format!(
                    "prompt contains failure marker {marker:?}"
                )));
            }
        }

        let words: Vec<&str> = prompt.split_whitespace().collect();
        for (i, word) in words.iter().take(params.max_tokens).enumerate() {
            if !self.config.token_delay.is_zero() {
                tokio::time::sleep(self.config.token_delay).await;
            }
            let logprob = if params.temperature > 0.0 {
                let jitter: f32 = rand::thread_rng().gen_range(0.0..0.01) * params.temperature;
                -0.1 * (i as f32 + 1.0) - jitter
            } else {
                0.0
            };
            let token = StreamToken::text(format!("{word} "), i as u32).with_logprob(logprob);
            if !sink.emit(0, token).await {
                return Ok(());
            }
        }
        sink.emit(0, StreamToken::end()).await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}
