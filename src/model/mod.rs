//! Model capability surface.
//!
//! A model plugs into the server through the [`TextGenerator`] trait: a
//! required single-prompt `generate`, an overridable batched entry point,
//! and optional health/cleanup hooks. Tokens leave the model through a
//! [`TokenSink`] as they are produced; the sink tells the model when a
//! slot's receiver is gone so it can stop generating for that slot.

mod echo;

pub use echo::{EchoModel, EchoModelConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Model rejected input: {0}")]
    InvalidInput(String),
}

/// One generated token, immutable once produced.
///
/// Serializes to the wire form used by both response modes:
/// `{"token": ..., "token_id": ..., "logprob": ...}`. The end-of-stream
/// flag is a producer-side signal and never reaches the client as a
/// content token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToken {
    #[serde(rename = "token")]
    pub text: String,
    pub token_id: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub logprob: Option<f32>,
    #[serde(skip, default)]
    pub end_of_stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub special: bool,
}

impl StreamToken {
    /// Content token with text and id.
    pub fn text(text: impl Into<String>, token_id: u32) -> Self {
        Self {
            text: text.into(),
            token_id,
            logprob: None,
            end_of_stream: false,
            special: false,
        }
    }

    pub fn with_logprob(mut self, logprob: f32) -> Self {
        self.logprob = Some(logprob);
        self
    }

    /// Producer-side end-of-stream marker.
    pub fn end() -> Self {
        Self {
            text: String::new(),
            token_id: 0,
            logprob: None,
            end_of_stream: true,
            special: true,
        }
    }
}

/// Sampling parameters for one prompt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateParams {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 1.0,
        }
    }
}

/// One prompt of a batch, in scheduler dequeue order.
#[derive(Debug, Clone)]
pub struct BatchPrompt {
    pub prompt: String,
    pub params: GenerateParams,
}

/// Receives tokens from a generator as they are produced.
///
/// `emit` returns `false` when the slot's receiver is gone (cap reached,
/// timeout, consumer disconnected). The generator should stop producing
/// for that slot; other slots of the batch are unaffected.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn emit(&self, slot: usize, token: StreamToken) -> bool;
}

/// A sink that discards everything. Used for warm-up generation.
pub struct DiscardSink;

#[async_trait]
impl TokenSink for DiscardSink {
    async fn emit(&self, _slot: usize, _token: StreamToken) -> bool {
        true
    }
}

/// Remaps a single-prompt generator's slot 0 onto a batch position.
struct OffsetSink<'a> {
    inner: &'a dyn TokenSink,
    slot: usize,
}

#[async_trait]
impl TokenSink for OffsetSink<'_> {
    async fn emit(&self, _slot: usize, token: StreamToken) -> bool {
        self.inner.emit(self.slot, token).await
    }
}

/// The pluggable generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate tokens for a single prompt, emitting into slot 0 of `sink`
    /// as they are produced.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        sink: &dyn TokenSink,
    ) -> Result<(), ModelError>;

    /// Batched entry point. The default runs the prompts in order through
    /// [`TextGenerator::generate`], remapping slot indices; backends that
    /// pack tensors override this.
    async fn generate_batch(
        &self,
        batch: &[BatchPrompt],
        sink: &dyn TokenSink,
    ) -> Result<(), ModelError> {
        for (slot, item) in batch.iter().enumerate() {
            let offset = OffsetSink { inner: sink, slot };
            self.generate(&item.prompt, &item.params, &offset).await?;
        }
        Ok(())
    }

    /// Liveness probe. Defaults to healthy for models without one.
    async fn health_check(&self) -> bool {
        true
    }

    /// Synchronous cleanup hook, invoked when the registry drops the last
    /// reference to an unloaded model.
    fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        emitted: Mutex<Vec<(usize, StreamToken)>>,
    }

    #[async_trait]
    impl TokenSink for Recording {
        async fn emit(&self, slot: usize, token: StreamToken) -> bool {
            self.emitted.lock().unwrap().push((slot, token));
            true
        }
    }

    struct OneTokenModel;

    #[async_trait]
    impl TextGenerator for OneTokenModel {
        async fn generate(
            &self,
            prompt: &str,
            _params: &GenerateParams,
            sink: &dyn TokenSink,
        ) -> Result<(), ModelError> {
            sink.emit(0, StreamToken::text(prompt.to_string(), 7)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_batch_remaps_slots_in_order() {
        let sink = Recording {
            emitted: Mutex::new(Vec::new()),
        };
        let batch = vec![
            BatchPrompt {
                prompt: "a".into(),
                params: GenerateParams::default(),
            },
            BatchPrompt {
                prompt: "b".into(),
                params: GenerateParams::default(),
            },
        ];
        OneTokenModel.generate_batch(&batch, &sink).await.unwrap();

        let emitted = sink.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0, 0);
        assert_eq!(emitted[0].1.text, "a");
        assert_eq!(emitted[1].0, 1);
        assert_eq!(emitted[1].1.text, "b");
    }

    #[test]
    fn token_wire_form_omits_internal_flags() {
        let token = StreamToken::text("hi", 3).with_logprob(-0.5);
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["token"], "hi");
        assert_eq!(json["token_id"], 3);
        assert!(json.get("end_of_stream").is_none());
        assert!(json.get("special").is_none());
    }
}
