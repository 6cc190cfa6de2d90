//! Ownership and lifecycle of all live token streams.
//!
//! The manager creates handle/receiver pairs, tracks their shared state,
//! and runs the idle sweeper: streams whose last-token age exceeds the
//! idle timeout are closed, and closed streams are retained one extra
//! sweep cycle so late drainers observe the terminal state before the
//! entry is reaped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::channel::{self, CloseReason, StreamHandle, StreamReceiver, StreamState};

/// Stream tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded buffer capacity per stream, in tokens.
    pub buffer_size: usize,
    /// Close an open stream whose last-token age exceeds this.
    pub idle_timeout_s: f64,
    /// Bounded wait for buffer room before a slow-consumer close.
    pub push_wait_s: f64,
    /// Idle sweeper cadence.
    pub sweep_interval_s: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            idle_timeout_s: 60.0,
            push_wait_s: 1.0,
            sweep_interval_s: 10.0,
        }
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_s)
    }

    pub fn push_wait(&self) -> Duration {
        Duration::from_secs_f64(self.push_wait_s)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_s)
    }
}

pub struct StreamManager {
    config: StreamConfig,
    streams: DashMap<Uuid, Arc<StreamState>>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: DashMap::new(),
        }
    }

    /// Allocate a stream for a request. The handle goes into the batch
    /// slot, the receiver is bound to the HTTP response body.
    pub fn create(&self, request_id: Uuid) -> (StreamHandle, StreamReceiver) {
        self.create_with_idle_timeout(request_id, self.config.idle_timeout())
    }

    /// As [`create`](Self::create) with an explicit idle timeout.
    pub fn create_with_idle_timeout(
        &self,
        request_id: Uuid,
        idle_timeout: Duration,
    ) -> (StreamHandle, StreamReceiver) {
        let (handle, receiver, state) = channel::channel(
            request_id,
            self.config.buffer_size,
            idle_timeout,
            self.config.push_wait(),
        );
        self.streams.insert(request_id, state);
        (handle, receiver)
    }

    /// Idempotent close of one stream by request id.
    pub fn close(&self, request_id: &Uuid, reason: CloseReason) {
        if let Some(state) = self.streams.get(request_id) {
            state.close(reason);
        }
    }

    /// Close every live stream. Shutdown path.
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.streams.iter() {
            entry.value().close(reason.clone());
        }
    }

    /// Streams still open (accepting pushes).
    pub fn open_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// All tracked streams, including closed-but-not-reaped ones.
    pub fn tracked_count(&self) -> usize {
        self.streams.len()
    }

    /// One sweep pass: close idle streams, reap streams that were already
    /// closed on the previous pass.
    pub fn sweep(&self) {
        let mut reaped = 0usize;
        let mut idled = 0usize;
        self.streams.retain(|_, state| {
            if state.is_closed() {
                if state.swept.swap(true, Ordering::AcqRel) {
                    reaped += 1;
                    return false;
                }
                return true;
            }
            if state.idle_for() > state.idle_timeout() {
                state.close(CloseReason::Idle);
                idled += 1;
            }
            true
        });
        if idled > 0 || reaped > 0 {
            tracing::debug!(idled, reaped, live = self.streams.len(), "stream sweep");
        }
    }

    /// Run the sweeper until shutdown. Returns a handle for join-on-exit.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self;
        let interval = manager.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        tracing::debug!("stream sweeper: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => manager.sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamToken;

    fn manager(idle_s: f64, sweep_s: f64) -> StreamManager {
        StreamManager::new(StreamConfig {
            buffer_size: 8,
            idle_timeout_s: idle_s,
            push_wait_s: 0.05,
            sweep_interval_s: sweep_s,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_idle_streams() {
        let mgr = manager(60.0, 10.0);
        let (handle, _receiver) = mgr.create(Uuid::new_v4());

        tokio::time::advance(Duration::from_secs(61)).await;
        mgr.sweep();
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_boundary_is_strict() {
        let mgr = manager(60.0, 10.0);
        let (handle, _receiver) = mgr.create(Uuid::new_v4());

        // Exactly the idle timeout: must not close.
        tokio::time::advance(Duration::from_secs(60)).await;
        mgr.sweep();
        assert!(!handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_tokens_keep_a_stream_alive() {
        let mgr = manager(60.0, 10.0);
        let (handle, _receiver) = mgr.create(Uuid::new_v4());

        tokio::time::advance(Duration::from_secs(50)).await;
        handle.push(StreamToken::text("tick", 0)).await;
        tokio::time::advance(Duration::from_secs(50)).await;
        mgr.sweep();
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn closed_streams_survive_one_sweep_then_reap() {
        let mgr = manager(60.0, 10.0);
        let id = Uuid::new_v4();
        let (handle, _receiver) = mgr.create(id);
        handle.close(CloseReason::EndOfStream);

        assert_eq!(mgr.tracked_count(), 1);
        mgr.sweep();
        // Retained so late drainers still observe the terminal state.
        assert_eq!(mgr.tracked_count(), 1);
        mgr.sweep();
        assert_eq!(mgr.tracked_count(), 0);
    }

    #[tokio::test]
    async fn close_all_hits_every_open_stream() {
        let mgr = manager(60.0, 10.0);
        let pairs: Vec<_> = (0..4).map(|_| mgr.create(Uuid::new_v4())).collect();
        assert_eq!(mgr.open_count(), 4);

        mgr.close_all(CloseReason::Shutdown);
        assert_eq!(mgr.open_count(), 0);
        for (handle, _) in &pairs {
            assert!(handle.is_closed());
        }
    }
}
