//! HTTP frontend: routes, admission, and response binding.
//!
//! Handlers run the middleware sequence explicitly (shutdown gate,
//! connection cap, validation, model lookup, rate limit, request log),
//! then enqueue and bind the response to the request's token stream.
//! The streaming body moves its admission guards into the body state so
//! shutdown drains active streams, not just open handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::middleware::Sample;
use crate::model::StreamToken;
use crate::scheduler::{BatchSlot, InferenceRequest, Priority, SchedulerError};
use crate::stream::{CloseReason, CompletionReason, StreamReceiver};
use crate::telemetry;
use crate::Server;

use super::connections::ConnectionGuard;
use super::shutdown::FlightGuard;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("rate limited")]
    RateLimited { retry_after_s: u64 },

    #[error("queue full")]
    QueueFull { retry_after_s: u64 },

    #[error("connection limit reached")]
    Overloaded,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("inference failed: {0}")]
    Inference(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnknownModel(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::QueueFull { .. } | Self::Overloaded | Self::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UnknownModel(_) => "unknown_model",
            Self::RateLimited { .. } => "rate_limited",
            Self::QueueFull { .. } => "queue_full",
            Self::Overloaded => "overloaded",
            Self::ShuttingDown => "shutting_down",
            Self::Inference(_) => "inference_error",
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_s } | Self::QueueFull { retry_after_s } => {
                Some(*retry_after_s)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        let mut response = (self.status(), body).into_response();
        if let Some(seconds) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// Peer address, when the transport provides one. Absent under
/// in-process test routers.
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

fn default_max_tokens() -> usize {
    100
}

fn default_temperature() -> f32 {
    1.0
}

/// JSON body of `/infer` and `/infer_stream`.
#[derive(Debug, Deserialize)]
pub struct InferRequestBody {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Non-streaming response: every token plus the terminal reason.
#[derive(Debug, Serialize)]
pub struct InferResponseBody {
    pub request_id: Uuid,
    pub tokens: Vec<StreamToken>,
    pub completion_reason: CompletionReason,
    pub total_time_ms: u64,
}

pub fn router(ctx: Arc<Server>) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .route("/infer_stream", post(infer_stream))
        .route("/health", get(health))
        .route("/models", get(models))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(ctx)
}

/// A request that cleared the middleware chain and is queued.
struct Admitted {
    request: InferenceRequest,
    receiver: StreamReceiver,
    admitted_at: Instant,
    _flight: FlightGuard,
    _conn: ConnectionGuard,
}

/// The ordered admission sequence shared by both inference endpoints.
async fn admit(
    ctx: &Arc<Server>,
    peer: PeerAddr,
    body: Result<Json<InferRequestBody>, JsonRejection>,
) -> Result<Admitted, ApiError> {
    let flight = ctx.shutdown.track().ok_or(ApiError::ShuttingDown)?;
    let conn = ctx
        .connections
        .try_acquire()
        .ok_or(ApiError::Overloaded)?;

    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let request = validate(ctx, body)?;

    // Model existence gates everything downstream, including the
    // per-model sequence-length bound.
    let model = ctx
        .registry
        .lookup(&request.model)
        .map_err(|_| ApiError::UnknownModel(request.model.clone()))?;
    if request.max_tokens > model.config.max_seq_length {
        return Err(ApiError::Validation(format!(
            "out_of_range: max_tokens {} exceeds model max_seq_length {}",
            request.max_tokens, model.config.max_seq_length
        )));
    }

    let caller = request
        .client_id
        .clone()
        .or_else(|| peer.0.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string());
    if let Err(limited) = ctx.rate_limiter.check(&caller) {
        ctx.request_log
            .rejected(Some(request.id), &caller, "rate_limited");
        telemetry::record_rate_limited(&request.model);
        return Err(ApiError::RateLimited {
            retry_after_s: limited.retry_after_s,
        });
    }

    ctx.request_log.admitted(&request);

    let (handle, receiver) = ctx
        .streams
        .create_with_idle_timeout(request.id, ctx.config.stream.idle_timeout());
    let admitted_at = Instant::now();
    let slot = BatchSlot::new(request.clone(), handle);

    if let Err(SchedulerError::QueueFull { priority }) =
        ctx.schedulers.scheduler_for(&request.model).enqueue(slot)
    {
        ctx.streams.close(&request.id, CloseReason::Disconnected);
        ctx.request_log.rejected(Some(request.id), &caller, "queue_full");
        tracing::warn!(model = %request.model, ?priority, "queue full");
        return Err(ApiError::QueueFull {
            retry_after_s: (ctx.config.batch.max_wait_ms / 1000).max(1),
        });
    }

    Ok(Admitted {
        request,
        receiver,
        admitted_at,
        _flight: flight,
        _conn: conn,
    })
}

fn validate(ctx: &Arc<Server>, body: InferRequestBody) -> Result<InferenceRequest, ApiError> {
    if body.model.is_empty() {
        return Err(ApiError::Validation("missing_field: model".into()));
    }
    if body.max_tokens == 0 {
        return Err(ApiError::Validation(
            "out_of_range: max_tokens must be >= 1".into(),
        ));
    }
    if body.temperature < 0.0 {
        return Err(ApiError::Validation(
            "out_of_range: temperature must be >= 0".into(),
        ));
    }
    let timeout = match body.timeout_s {
        Some(seconds) if seconds <= 0.0 => {
            return Err(ApiError::Validation(
                "out_of_range: timeout_s must be > 0".into(),
            ));
        }
        Some(seconds) => std::time::Duration::from_secs_f64(seconds),
        None => ctx.config.server.request_timeout(),
    };

    Ok(InferenceRequest {
        id: Uuid::new_v4(),
        client_id: body.client_id,
        model: body.model,
        prompt: body.prompt,
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        priority: body.priority,
        timeout,
        metadata: body.metadata,
    })
}

/// Record one completed request in the window, the facade, and the log.
fn record_completion(
    ctx: &Arc<Server>,
    request: &InferenceRequest,
    reason: &CloseReason,
    tokens: u64,
    admitted_at: Instant,
) {
    let latency = admitted_at.elapsed();
    let error = matches!(
        reason,
        CloseReason::InferenceError(_) | CloseReason::Disconnected | CloseReason::Shutdown
    );
    ctx.metrics.record(
        &request.model,
        Sample {
            latency,
            tokens,
            error,
            completed_at: Instant::now(),
        },
    );
    telemetry::record_request_completed(&request.model, error, tokens);
    ctx.request_log
        .completed(request, reason, tokens, latency.as_millis() as u64);
}

async fn infer(
    State(ctx): State<Arc<Server>>,
    peer: PeerAddr,
    body: Result<Json<InferRequestBody>, JsonRejection>,
) -> Result<Json<InferResponseBody>, ApiError> {
    let mut admitted = admit(&ctx, peer, body).await?;

    let mut tokens = Vec::new();
    while let Some(token) = admitted.receiver.next().await {
        tokens.push(token);
    }
    let reason = admitted.receiver.close_reason();
    record_completion(
        &ctx,
        &admitted.request,
        &reason,
        tokens.len() as u64,
        admitted.admitted_at,
    );

    // A batch-atomic model failure surfaces as 500; nothing was streamed
    // in this mode, so no partial success escapes.
    if let CloseReason::InferenceError(message) = reason {
        return Err(ApiError::Inference(message));
    }

    Ok(Json(InferResponseBody {
        request_id: admitted.request.id,
        tokens,
        completion_reason: reason.completion(),
        total_time_ms: admitted.admitted_at.elapsed().as_millis() as u64,
    }))
}

/// Streaming body state. Guards ride along so shutdown waits for the
/// body, not just the handler.
struct NdjsonBody {
    ctx: Arc<Server>,
    request: InferenceRequest,
    receiver: StreamReceiver,
    admitted_at: Instant,
    tokens_sent: u64,
    terminal_sent: bool,
    recorded: bool,
    _flight: FlightGuard,
    _conn: ConnectionGuard,
}

impl NdjsonBody {
    fn record_once(&mut self, reason: &CloseReason) {
        if !self.recorded {
            self.recorded = true;
            record_completion(
                &self.ctx,
                &self.request,
                reason,
                self.tokens_sent,
                self.admitted_at,
            );
        }
    }
}

impl Drop for NdjsonBody {
    fn drop(&mut self) {
        // The client went away mid-stream: cancel and account for it.
        if !self.recorded {
            self.receiver.close(CloseReason::Disconnected);
            self.record_once(&CloseReason::Disconnected);
        }
    }
}

fn ndjson_line(value: &impl Serialize) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

async fn infer_stream(
    State(ctx): State<Arc<Server>>,
    peer: PeerAddr,
    body: Result<Json<InferRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let admitted = admit(&ctx, peer, body).await?;

    let state = NdjsonBody {
        ctx: Arc::clone(&ctx),
        request: admitted.request,
        receiver: admitted.receiver,
        admitted_at: admitted.admitted_at,
        tokens_sent: 0,
        terminal_sent: false,
        recorded: false,
        _flight: admitted._flight,
        _conn: admitted._conn,
    };

    let body = Body::from_stream(futures::stream::unfold(state, |mut state| async move {
        if state.terminal_sent {
            return None;
        }
        match state.receiver.next().await {
            Some(token) => {
                state.tokens_sent += 1;
                Some((Ok::<_, Infallible>(ndjson_line(&token)), state))
            }
            None => {
                state.terminal_sent = true;
                let reason = state.receiver.close_reason();
                state.record_once(&reason);
                let terminal = match &reason {
                    CloseReason::InferenceError(message) => json!({
                        "end": true,
                        "completion_reason": reason.completion(),
                        "error": message,
                    }),
                    _ => json!({
                        "end": true,
                        "completion_reason": reason.completion(),
                    }),
                };
                Some((Ok(ndjson_line(&terminal)), state))
            }
        }
    }));

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

async fn health(State(ctx): State<Arc<Server>>) -> Response {
    if ctx.shutdown.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "draining" })),
        )
            .into_response();
    }
    telemetry::record_open_streams(ctx.streams.open_count());
    Json(json!({
        "status": "ok",
        "connections": ctx.connections.active(),
        "streams": ctx.streams.open_count(),
    }))
    .into_response()
}

async fn models(State(ctx): State<Arc<Server>>) -> Response {
    Json(json!({ "models": ctx.registry.list() })).into_response()
}

async fn metrics(State(ctx): State<Arc<Server>>) -> Response {
    Json(ctx.metrics.all()).into_response()
}

async fn status(State(ctx): State<Arc<Server>>) -> Response {
    let queues: Vec<_> = ctx
        .schedulers
        .queue_depths()
        .into_iter()
        .map(|(model, pending)| json!({ "model": model, "pending": pending }))
        .collect();
    Json(json!({
        "status": if ctx.shutdown.is_draining() { "draining" } else { "ok" },
        "uptime_s": ctx.uptime().as_secs(),
        "connections": {
            "active": ctx.connections.active(),
            "max": ctx.connections.max(),
        },
        "streams": {
            "open": ctx.streams.open_count(),
            "tracked": ctx.streams.tracked_count(),
        },
        "queues": queues,
        "models": ctx.registry.list(),
        "metrics": ctx.metrics.all(),
    }))
    .into_response()
}
