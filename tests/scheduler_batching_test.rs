// Copyright 2024-2026 Fluxserve Contributors
// SPDX-License-Identifier: Apache-2.0

//! Batch formation under load: strict priority, deadlines, size caps,
//! queue flooding, and concurrent enqueue.

use std::sync::Arc;
use std::time::Duration;

use fluxserve::scheduler::{
    BatchConfig, BatchScheduler, BatchSlot, InferenceRequest, Priority,
};
use fluxserve::stream::{StreamConfig, StreamManager};
use uuid::Uuid;

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
    BatchSlot::new(req, handle)
}

fn harness(config: BatchConfig) -> (Arc<BatchScheduler>, StreamManager) {
    (
        Arc::new(BatchScheduler::new("m", config)),
        StreamManager::new(StreamConfig::default()),
    )
}

// ============================================================================
// Priority ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn one_high_preempts_forty_normals() {
    let (sched, mgr) = harness(BatchConfig {
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
async fn batches_are_sorted_by_priority_then_fifo() {
    let (sched, mgr) = harness(BatchConfig::default());
    sched.enqueue(slot(&mgr, Priority::Low, "l0")).unwrap();
    sched.enqueue(slot(&mgr, Priority::Normal, "n0")).unwrap();
    sched.enqueue(slot(&mgr, Priority::High, "h0")).unwrap();
    sched.enqueue(slot(&mgr, Priority::Normal, "n1")).unwrap();
    sched.enqueue(slot(&mgr, Priority::High, "h1")).unwrap();

    let batch = sched.next_batch().await;
    let tags: Vec<&str> = batch.iter().map(|s| s.request.prompt.as_str()).collect();
    assert_eq!(tags, vec!["h0", "h1", "n0", "n1", "l0"]);
}

// ============================================================================
// Deadline and size-cap behavior
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lone_request_is_emitted_at_the_deadline() {
    let (sched, mgr) = harness(BatchConfig {
        max_wait_ms: 50,
        ..Default::default()
    });
    sched.enqueue(slot(&mgr, Priority::Normal, "only")).unwrap();

    let started = tokio::time::Instant::now();
    let batch = sched.next_batch().await;
    let waited = started.elapsed();

    assert_eq!(batch.len(), 1);
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(100), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn full_queue_returns_without_waiting() {
    let (sched, mgr) = harness(BatchConfig {
        max_batch_size: 8,
        max_wait_ms: 60_000,
        ..Default::default()
    });
    for i in 0..8 {
        sched
            .enqueue(slot(&mgr, Priority::Normal, &format!("n{i}")))
            .unwrap();
    }

    let started = tokio::time::Instant::now();
    let batch = sched.next_batch().await;
    assert_eq!(batch.len(), 8);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn every_batch_is_within_bounds() {
    let (sched, mgr) = harness(BatchConfig {
        max_batch_size: 4,
        max_wait_ms: 10,
        ..Default::default()
    });
    for i in 0..11 {
        sched
            .enqueue(slot(&mgr, Priority::Normal, &format!("n{i}")))
            .unwrap();
    }

    let mut seen = 0;
    while seen < 11 {
        let batch = sched.next_batch().await;
        assert!(!batch.is_empty());
        assert!(batch.len() <= 4);
        seen += batch.len();
    }
    assert_eq!(seen, 11);
}

// ============================================================================
// Queue flooding and concurrency
// ============================================================================

#[tokio::test]
async fn flooded_lane_rejects_until_drained() {
    let (sched, mgr) = harness(BatchConfig {
        queue_capacity: 5,
        ..Default::default()
    });
    for i in 0..5 {
        sched
            .enqueue(slot(&mgr, Priority::Normal, &format!("n{i}")))
            .unwrap();
    }
    assert!(sched.enqueue(slot(&mgr, Priority::Normal, "over")).is_err());

    // Draining a batch frees capacity again.
    let batch = sched.next_batch().await;
    assert_eq!(batch.len(), 5);
    sched.enqueue(slot(&mgr, Priority::Normal, "ok")).unwrap();
}

#[tokio::test]
async fn concurrent_enqueue_loses_nothing() {
    let (sched, _mgr) = harness(BatchConfig {
        max_batch_size: 16,
        max_wait_ms: 10,
        queue_capacity: 1024,
    });
    let mgr = Arc::new(StreamManager::new(StreamConfig::default()));

    let mut producers = Vec::new();
    for pid in 0..4 {
        let sched = Arc::clone(&sched);
        let mgr = Arc::clone(&mgr);
        producers.push(tokio::spawn(async move {
            for i in 0..25 {
                sched
                    .enqueue(slot(&mgr, Priority::Normal, &format!("p{pid}-{i}")))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let mut seen = 0;
    while seen < 100 {
        seen += sched.next_batch().await.len();
    }
    assert_eq!(seen, 100);
    assert_eq!(sched.pending(), 0);
}
