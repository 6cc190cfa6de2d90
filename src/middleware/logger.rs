//! Structured per-request logging at admission and completion.
//!
//! One event when a request clears the middleware chain, one when its
//! stream terminates. Rejections get their own event so a rate-limited
//! caller is visible without counting as an error.

use crate::scheduler::InferenceRequest;
use crate::stream::CloseReason;

const TARGET: &str = "fluxserve::request";

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl RequestLogger {
    pub fn admitted(&self, request: &InferenceRequest) {
        tracing::info!(
            target: TARGET,
            request_id = %request.id,
            client_id = request.client_id.as_deref().unwrap_or("-"),
            model = %request.model,
            priority = ?request.priority,
            max_tokens = request.max_tokens,
            "admitted"
        );
    }

    pub fn completed(
        &self,
        request: &InferenceRequest,
        reason: &CloseReason,
        tokens: u64,
        latency_ms: u64,
    ) {
        tracing::info!(
            target: TARGET,
            request_id = %request.id,
            client_id = request.client_id.as_deref().unwrap_or("-"),
            model = %request.model,
            priority = ?request.priority,
            outcome = %reason,
            tokens,
            latency_ms,
            "completed"
        );
    }

    pub fn rejected(&self, request_id: Option<uuid::Uuid>, client: &str, reason: &str) {
        tracing::info!(
            target: TARGET,
            request_id = %request_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            client_id = client,
            reason,
            "rejected"
        );
    }
}
