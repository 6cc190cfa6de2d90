//! Per-model worker loop: pull a batch, run the model, fan tokens out.
//!
//! One runner per scheduler. The runner resolves the active model
//! version once per batch and holds that reference until the batch
//! finishes, so a hot swap never disturbs work already dispatched. A
//! model error closes every remaining stream of the batch; the batch is
//! atomic for failure purposes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::{BatchPrompt, GenerateParams, StreamToken, TokenSink};
use crate::registry::{LoadedModel, ModelRegistry};
use crate::stream::{CloseReason, PushOutcome, StreamHandle};
use crate::telemetry;

use super::queue::{BatchScheduler, BatchSlot};

/// Spawn the runner loop for one model name. Returns a handle for
/// join-on-shutdown.
pub fn spawn_runner(
    scheduler: Arc<BatchScheduler>,
    registry: Arc<ModelRegistry>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        runner_loop(&scheduler, &registry, shutdown).await;
    })
}

async fn runner_loop(
    scheduler: &BatchScheduler,
    registry: &ModelRegistry,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!(model = scheduler.model(), "runner: shutdown signal received");
                break;
            }
            batch = scheduler.next_batch() => {
                run_batch(scheduler.model(), registry, batch).await;
            }
        }
    }
}

/// Execute one batch end to end.
pub async fn run_batch(model_name: &str, registry: &ModelRegistry, batch: Vec<BatchSlot>) {
    if batch.is_empty() {
        return;
    }

    let model = match registry.lookup(model_name) {
        Ok(model) => model,
        Err(e) => {
            // The model was unloaded after these requests were admitted.
            let message = e.to_string();
            for slot in &batch {
                slot.stream
                    .close(CloseReason::InferenceError(message.clone()));
            }
            tracing::warn!(model = model_name, error = %message, "batch dropped");
            return;
        }
    };

    dispatch_batch(&model, batch).await;
}

async fn dispatch_batch(model: &Arc<LoadedModel>, batch: Vec<BatchSlot>) {
    let started = Instant::now();
    let batch_size = batch.len();

    let mut prompts = Vec::with_capacity(batch.len());
    let mut slots = Vec::with_capacity(batch.len());
    for slot in batch {
        model.stats.record_request();
        prompts.push(BatchPrompt {
            prompt: slot.request.prompt.clone(),
            params: GenerateParams {
                max_tokens: slot.request.max_tokens,
                temperature: slot.request.temperature,
            },
        });
        let deadline = slot.admitted_at + slot.request.timeout;
        slots.push(SlotSink {
            stream: slot.stream,
            max_tokens: slot.request.max_tokens as u64,
            deadline,
            emitted: AtomicU64::new(0),
            done: AtomicBool::new(false),
        });
    }

    // Requests that burned their whole budget in the queue never reach
    // the model.
    let now = Instant::now();
    for slot in &slots {
        if now > slot.deadline {
            slot.finish(CloseReason::RequestTimeout);
        }
    }

    let sink = FanoutSink { slots };
    let result = model.generator().generate_batch(&prompts, &sink).await;

    match result {
        Ok(()) => {
            for slot in &sink.slots {
                slot.finish(CloseReason::EndOfStream);
                model.stats.record_tokens(slot.emitted.load(Ordering::Relaxed));
            }
            telemetry::record_batch_success(
                &model.config.name,
                started.elapsed().as_millis() as u64,
            );
        }
        Err(e) => {
            let message = e.to_string();
            for slot in &sink.slots {
                slot.finish(CloseReason::InferenceError(message.clone()));
                model.stats.record_error();
                model.stats.record_tokens(slot.emitted.load(Ordering::Relaxed));
            }
            telemetry::record_batch_failure(&model.config.name);
            tracing::error!(
                model = %model.config.name,
                version = %model.version,
                batch_size,
                error = %message,
                "batch failed"
            );
        }
    }
}

/// Producer-side bookkeeping for one slot of a running batch.
struct SlotSink {
    stream: StreamHandle,
    max_tokens: u64,
    deadline: Instant,
    emitted: AtomicU64,
    done: AtomicBool,
}

impl SlotSink {
    /// Deliver the terminal event exactly once.
    fn finish(&self, reason: CloseReason) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.stream.close(reason);
        }
    }
}

/// Fans model output into the originating streams, enforcing each
/// request's token cap and wall-time budget independently.
struct FanoutSink {
    slots: Vec<SlotSink>,
}

#[async_trait]
impl TokenSink for FanoutSink {
    async fn emit(&self, slot_index: usize, token: StreamToken) -> bool {
        let Some(slot) = self.slots.get(slot_index) else {
            return false;
        };
        if slot.done.load(Ordering::Acquire) {
            return false;
        }
        if Instant::now() > slot.deadline {
            slot.finish(CloseReason::RequestTimeout);
            return false;
        }
        if token.end_of_stream {
            slot.finish(CloseReason::EndOfStream);
            return false;
        }
        match slot.stream.push(token).await {
            PushOutcome::Accepted | PushOutcome::Backpressured => {
                let emitted = slot.emitted.fetch_add(1, Ordering::Relaxed) + 1;
                if emitted >= slot.max_tokens {
                    slot.finish(CloseReason::EndOfStream);
                    return false;
                }
                true
            }
            // Slow consumer, disconnect, or an external close. The reason
            // is already recorded; just stop producing for this slot.
            PushOutcome::Closed => {
                slot.done.store(true, Ordering::Release);
                false
            }
        }
    }
}
