//! Priority queues and pull-based batch formation.
//!
//! Three bounded FIFO queues, one per priority class. The runner pulls
//! with `next_batch`: the first available item starts the batch
//! deadline, then items are drained in strict priority order until the
//! size cap or the deadline trips. Every returned batch holds at least
//! one slot.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::stream::StreamHandle;
use crate::telemetry;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("{priority:?} queue is full")]
    QueueFull { priority: Priority },
}

/// Strict ordering class. HIGH drains before NORMAL before LOW.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// A request as the scheduler and runner see it.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub client_id: Option<String>,
    pub model: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub priority: Priority,
    /// Wall-time budget, measured from admission.
    pub timeout: Duration,
    /// Opaque caller bag, carried through untouched.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One queued unit of work: the request plus the producer half of its
/// token stream.
pub struct BatchSlot {
    pub request: InferenceRequest,
    pub stream: StreamHandle,
    pub admitted_at: Instant,
}

impl BatchSlot {
    pub fn new(request: InferenceRequest, stream: StreamHandle) -> Self {
        Self {
            request,
            stream,
            admitted_at: Instant::now(),
        }
    }
}

/// Batch tunables, a section of the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound on slots per batch.
    pub max_batch_size: usize,
    /// Deadline from first held item to batch emission.
    pub max_wait_ms: u64,
    /// Bounded capacity of each priority queue.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait_ms: 50,
            queue_capacity: 1024,
        }
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Default)]
struct PriorityQueues {
    high: VecDeque<BatchSlot>,
    normal: VecDeque<BatchSlot>,
    low: VecDeque<BatchSlot>,
}

impl PriorityQueues {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<BatchSlot> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop_strict(&mut self) -> Option<BatchSlot> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn depths(&self) -> (usize, usize, usize) {
        (self.high.len(), self.normal.len(), self.low.len())
    }
}

/// One scheduler per active model name.
pub struct BatchScheduler {
    model: String,
    config: BatchConfig,
    queues: Mutex<PriorityQueues>,
    wakeup: Notify,
}

impl BatchScheduler {
    pub fn new(model: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            model: model.into(),
            config,
            queues: Mutex::new(PriorityQueues::default()),
            wakeup: Notify::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Queue a slot by its priority, or report the lane full.
    pub fn enqueue(&self, slot: BatchSlot) -> Result<(), SchedulerError> {
        let priority = slot.request.priority;
        let depths = {
            let mut queues = self.queues.lock();
            let lane = queues.lane(priority);
            if lane.len() >= self.config.queue_capacity {
                return Err(SchedulerError::QueueFull { priority });
            }
            lane.push_back(slot);
            queues.depths()
        };
        telemetry::record_queue_depth(&self.model, depths.0 + depths.1 + depths.2);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Pull the next batch: blocks until at least one slot is queued,
    /// then drains in strict (priority, FIFO) order until the size cap
    /// or the deadline from the first held item trips.
    pub async fn next_batch(&self) -> Vec<BatchSlot> {
        let mut batch = Vec::new();

        loop {
            self.drain_into(&mut batch);
            if !batch.is_empty() {
                break;
            }
            self.wakeup.notified().await;
        }

        let deadline = Instant::now() + self.config.max_wait();
        while batch.len() < self.config.max_batch_size {
            self.drain_into(&mut batch);
            if batch.len() >= self.config.max_batch_size {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if tokio::time::timeout(deadline - now, self.wakeup.notified())
                .await
                .is_err()
            {
                break;
            }
        }

        telemetry::record_batch_size(&self.model, batch.len());
        telemetry::record_queue_depth(&self.model, self.pending());
        batch
    }

    fn drain_into(&self, batch: &mut Vec<BatchSlot>) {
        let mut queues = self.queues.lock();
        while batch.len() < self.config.max_batch_size {
            match queues.pop_strict() {
                Some(slot) => batch.push(slot),
                None => break,
            }
        }
    }

    /// Per-priority depths (high, normal, low).
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        self.queues.lock().depths()
    }

    pub fn pending(&self) -> usize {
        let (h, n, l) = self.queue_depths();
        h + n + l
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamConfig, StreamManager};

    fn request(priority: Priority, tag: &str) -> InferenceRequest {
        InferenceRequest {
            id: Uuid::new_v4(),
            client_id: None,
            model: "m".into(),
            prompt: tag.into(),
            max_tokens: 8,
            temperature: 0.0,
            priority,
            timeout: Duration::from_secs(30),
            metadata: serde_json::Map::new(),
        }
    }

    fn slot(manager: &StreamManager, priority: Priority, tag: &str) -> BatchSlot {
        let req = request(priority, tag);
        let (handle, _receiver) = manager.create(req.id);
        // Receiver intentionally dropped; these tests only exercise queuing.
        BatchSlot::new(req, handle)
    }

    fn scheduler(config: BatchConfig) -> (BatchScheduler, StreamManager) {
        (
            BatchScheduler::new("m", config),
            StreamManager::new(StreamConfig::default()),
        )
    }

    #[tokio::test]
    async fn full_lane_rejects() {
        let (sched, mgr) = scheduler(BatchConfig {
            queue_capacity: 2,
            ..Default::default()
        });
        sched.enqueue(slot(&mgr, Priority::Normal, "a")).unwrap();
        sched.enqueue(slot(&mgr, Priority::Normal, "b")).unwrap();
        let err = sched.enqueue(slot(&mgr, Priority::Normal, "c")).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::QueueFull {
                priority: Priority::Normal
            }
        ));
        // Other lanes are unaffected.
        sched.enqueue(slot(&mgr, Priority::High, "d")).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn strict_priority_order_within_a_batch() {
        let (sched, mgr) = scheduler(BatchConfig::default());
        sched.enqueue(slot(&mgr, Priority::Low, "l")).unwrap();
        sched.enqueue(slot(&mgr, Priority::Normal, "n")).unwrap();
        sched.enqueue(slot(&mgr, Priority::High, "h")).unwrap();

        let batch = sched.next_batch().await;
        let tags: Vec<&str> = batch.iter().map(|s| s.request.prompt.as_str()).collect();
        assert_eq!(tags, vec!["h", "n", "l"]);
    }

    #[tokio::test(start_paused = true)]
    async fn high_preempts_queued_normals() {
        let (sched, mgr) = scheduler(BatchConfig {
            max_batch_size: 32,
            ..Default::default()
        });
        for i in 0..40 {
            sched
                .enqueue(slot(&mgr, Priority::Normal, &format!("n{i}")))
                .unwrap();
        }
        sched.enqueue(slot(&mgr, Priority::High, "h")).unwrap();

        let first = sched.next_batch().await;
        assert_eq!(first.len(), 32);
        assert_eq!(first[0].request.prompt, "h");
        assert!(first[1..]
            .iter()
            .all(|s| s.request.priority == Priority::Normal));

        let second = sched.next_batch().await;
        assert_eq!(second.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn single_item_waits_out_the_deadline() {
        let (sched, mgr) = scheduler(BatchConfig {
            max_wait_ms: 50,
            ..Default::default()
        });
        sched.enqueue(slot(&mgr, Priority::Normal, "only")).unwrap();

        let started = Instant::now();
        let batch = sched.next_batch().await;
        let waited = started.elapsed();

        assert_eq!(batch.len(), 1);
        assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
        assert!(waited < Duration::from_millis(80), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn size_cap_fires_before_deadline() {
        let (sched, mgr) = scheduler(BatchConfig {
            max_batch_size: 4,
            max_wait_ms: 10_000,
            ..Default::default()
        });
        for i in 0..4 {
            sched
                .enqueue(slot(&mgr, Priority::Normal, &format!("n{i}")))
                .unwrap();
        }

        let started = Instant::now();
        let batch = sched.next_batch().await;
        assert_eq!(batch.len(), 4);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrivals_join_until_deadline() {
        let (sched, mgr) = scheduler(BatchConfig {
            max_batch_size: 8,
            max_wait_ms: 100,
            ..Default::default()
        });
        let sched = std::sync::Arc::new(sched);
        sched.enqueue(slot(&mgr, Priority::Normal, "first")).unwrap();

        let puller = {
            let sched = std::sync::Arc::clone(&sched);
            tokio::spawn(async move { sched.next_batch().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.enqueue(slot(&mgr, Priority::Normal, "late")).unwrap();

        let batch = puller.await.unwrap();
        let tags: Vec<&str> = batch.iter().map(|s| s.request.prompt.as_str()).collect();
        assert_eq!(tags, vec!["first", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queues_block_until_enqueue() {
        let (sched, mgr) = scheduler(BatchConfig::default());
        let sched = std::sync::Arc::new(sched);

        let puller = {
            let sched = std::sync::Arc::clone(&sched);
            tokio::spawn(async move { sched.next_batch().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!puller.is_finished());

        sched.enqueue(slot(&mgr, Priority::Low, "wake")).unwrap();
        let batch = puller.await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
