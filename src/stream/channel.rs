//! Per-request token channel.
//!
//! Single producer (the inference runner), single consumer (the HTTP
//! response writer). A bounded buffer gives backpressure: a full buffer
//! makes the producer wait a short bounded interval, then close the
//! stream as a slow consumer. Close is one-way and idempotent; closing
//! is the universal cancellation primitive for the whole pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
// Clock-aware Instant so paused-time tests drive the idle logic.
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::StreamToken;

/// Why a stream stopped accepting tokens. The first close wins.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Generation finished normally.
    EndOfStream,
    /// The consumer could not keep up within the push wait.
    SlowConsumer,
    /// No token arrived within the idle timeout.
    Idle,
    /// The request exceeded its wall-time budget.
    RequestTimeout,
    /// The model failed; carries the error message.
    InferenceError(String),
    /// The consumer went away (connection drop).
    Disconnected,
    /// Server shutdown cancelled the stream.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end-of-stream"),
            Self::SlowConsumer => write!(f, "slow-consumer"),
            Self::Idle => write!(f, "idle"),
            Self::RequestTimeout => write!(f, "request-timeout"),
            Self::InferenceError(msg) => write!(f, "inference-error: {msg}"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Client-facing completion reason carried by the terminal response object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    Done,
    Timeout,
    Error,
}

impl CloseReason {
    pub fn completion(&self) -> CompletionReason {
        match self {
            Self::EndOfStream | Self::SlowConsumer => CompletionReason::Done,
            Self::Idle | Self::RequestTimeout => CompletionReason::Timeout,
            Self::InferenceError(_) | Self::Disconnected | Self::Shutdown => {
                CompletionReason::Error
            }
        }
    }
}

/// Outcome of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Inserted without waiting.
    Accepted,
    /// Inserted after waiting for buffer room.
    Backpressured,
    /// The stream is closed; permanent for this stream.
    Closed,
}

/// State shared by handle, receiver, and the stream manager.
pub(crate) struct StreamState {
    pub(crate) request_id: Uuid,
    idle_timeout: Duration,
    push_wait: Duration,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    last_token: Mutex<Instant>,
    tokens: AtomicU64,
    backpressure_events: AtomicU64,
    /// Set by the sweeper on the cycle after close; reaped on the next.
    pub(crate) swept: AtomicBool,
}

impl StreamState {
    pub(crate) fn new(request_id: Uuid, idle_timeout: Duration, push_wait: Duration) -> Self {
        Self {
            request_id,
            idle_timeout,
            push_wait,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            last_token: Mutex::new(Instant::now()),
            tokens: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            swept: AtomicBool::new(false),
        }
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
            self.closed.cancel();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_token.lock().elapsed()
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn note_token(&self) {
        *self.last_token.lock() = Instant::now();
        self.tokens.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer half, held by the inference runner through a batch slot.
pub struct StreamHandle {
    state: Arc<StreamState>,
    tx: mpsc::Sender<StreamToken>,
}

/// Consumer half, bound to the HTTP response body.
pub struct StreamReceiver {
    state: Arc<StreamState>,
    rx: mpsc::Receiver<StreamToken>,
}

/// Build a connected handle/receiver pair. The manager registers the
/// shared state; tests use this directly.
pub(crate) fn channel(
    request_id: Uuid,
    buffer: usize,
    idle_timeout: Duration,
    push_wait: Duration,
) -> (StreamHandle, StreamReceiver, Arc<StreamState>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let state = Arc::new(StreamState::new(request_id, idle_timeout, push_wait));
    (
        StreamHandle {
            state: Arc::clone(&state),
            tx,
        },
        StreamReceiver {
            state: Arc::clone(&state),
            rx,
        },
        state,
    )
}

impl StreamHandle {
    pub fn request_id(&self) -> Uuid {
        self.state.request_id
    }

    /// Push one token, waiting a bounded interval when the buffer is full.
    ///
    /// A full buffer after the wait closes the stream as a slow consumer;
    /// the caller must treat [`PushOutcome::Closed`] as permanent.
    pub async fn push(&self, token: StreamToken) -> PushOutcome {
        if self.state.is_closed() {
            return PushOutcome::Closed;
        }
        match self.tx.try_send(token) {
            Ok(()) => {
                self.state.note_token();
                PushOutcome::Accepted
            }
            Err(TrySendError::Closed(_)) => {
                self.state.close(CloseReason::Disconnected);
                PushOutcome::Closed
            }
            Err(TrySendError::Full(token)) => {
                self.state
                    .backpressure_events
                    .fetch_add(1, Ordering::Relaxed);
                self.push_slow(token).await
            }
        }
    }

    async fn push_slow(&self, token: StreamToken) -> PushOutcome {
        tokio::select! {
            () = self.state.closed.cancelled() => PushOutcome::Closed,
            sent = tokio::time::timeout(self.state.push_wait, self.tx.send(token)) => {
                match sent {
                    Ok(Ok(())) => {
                        self.state.note_token();
                        PushOutcome::Backpressured
                    }
                    Ok(Err(_)) => {
                        self.state.close(CloseReason::Disconnected);
                        PushOutcome::Closed
                    }
                    Err(_) => {
                        self.state.close(CloseReason::SlowConsumer);
                        PushOutcome::Closed
                    }
                }
            }
        }
    }

    /// Idempotent close; the first reason is the one observed.
    pub fn close(&self, reason: CloseReason) {
        self.state.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn tokens_pushed(&self) -> u64 {
        self.state.tokens.load(Ordering::Relaxed)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.state.backpressure_events.load(Ordering::Relaxed)
    }
}

impl StreamReceiver {
    pub fn request_id(&self) -> Uuid {
        self.state.request_id
    }

    /// Next token in push order, or `None` on any terminal condition.
    ///
    /// Buffered tokens are always delivered before a close is observed,
    /// so a slow-consumer close never loses what was already accepted.
    /// Waiting longer than the idle timeout with no token closes the
    /// stream as idle; a token that lands exactly on the boundary is
    /// delivered (strict greater-than).
    pub async fn next(&mut self) -> Option<StreamToken> {
        loop {
            match self.rx.try_recv() {
                Ok(token) => return Some(token),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.state.is_closed() {
                return None;
            }
            let waited = tokio::time::timeout(self.state.idle_timeout, async {
                tokio::select! {
                    () = self.state.closed.cancelled() => None,
                    token = self.rx.recv() => token,
                }
            })
            .await;
            match waited {
                Ok(Some(token)) => return Some(token),
                // Closed or sender gone; loop once more to drain stragglers.
                Ok(None) => {}
                Err(_) => {
                    if self.state.idle_for() > self.state.idle_timeout() {
                        self.state.close(CloseReason::Idle);
                        return None;
                    }
                }
            }
        }
    }

    /// Terminal reason once the stream has closed. A dropped producer with
    /// no recorded reason reads as a normal end of stream.
    pub fn close_reason(&self) -> CloseReason {
        self.state
            .close_reason()
            .unwrap_or(CloseReason::EndOfStream)
    }

    pub fn close(&self, reason: CloseReason) {
        self.state.close(reason);
    }
}
