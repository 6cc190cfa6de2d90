// Copyright 2024-2026 Fluxserve Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stream behavior under a slow or absent consumer, and the idle sweep
//! lifecycle.

use std::time::Duration;

use fluxserve::model::StreamToken;
use fluxserve::stream::{CloseReason, PushOutcome, StreamConfig, StreamManager};
use uuid::Uuid;

fn manager(buffer: usize, push_wait_s: f64) -> StreamManager {
    StreamManager::new(StreamConfig {
        buffer_size: buffer,
        push_wait_s,
        idle_timeout_s: 60.0,
        sweep_interval_s: 10.0,
    })
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_gets_the_buffered_prefix_then_close() {
    let mgr = manager(100, 1.0);
    let (handle, mut receiver) = mgr.create(Uuid::new_v4());

    // Producer pushes 200 tokens with nobody reading: the buffer takes
    // 100, the next push waits out the 1s bound, then the stream is a
    // slow consumer and every later push is rejected immediately.
    let mut accepted = 0u32;
    for i in 0..200u32 {
        match handle.push(StreamToken::text(format!("t{i}"), i)).await {
            PushOutcome::Accepted | PushOutcome::Backpressured => accepted += 1,
            PushOutcome::Closed => {}
        }
    }
    assert_eq!(accepted, 100);
    assert!(handle.is_closed());
    assert_eq!(handle.backpressure_events(), 1);

    // The accepted prefix is still delivered, in order, then the
    // terminal state.
    let mut drained = Vec::new();
    while let Some(token) = receiver.next().await {
        drained.push(token.token_id);
    }
    assert_eq!(drained, (0..100).collect::<Vec<_>>());
    assert_eq!(receiver.close_reason(), CloseReason::SlowConsumer);
}

#[tokio::test(start_paused = true)]
async fn waking_consumer_unblocks_a_backpressured_push() {
    let mgr = manager(2, 1.0);
    let (handle, mut receiver) = mgr.create(Uuid::new_v4());

    handle.push(StreamToken::text("a", 0)).await;
    handle.push(StreamToken::text("b", 1)).await;

    let producer = tokio::spawn(async move {
        let outcome = handle.push(StreamToken::text("c", 2)).await;
        (handle, outcome)
    });

    // Consumer wakes well inside the push wait.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(receiver.next().await.unwrap().token_id, 0);

    let (_handle, outcome) = producer.await.unwrap();
    assert_eq!(outcome, PushOutcome::Backpressured);
    assert_eq!(receiver.next().await.unwrap().token_id, 1);
    assert_eq!(receiver.next().await.unwrap().token_id, 2);
}

#[tokio::test(start_paused = true)]
async fn drain_observes_a_prefix_extension_over_time() {
    let mgr = manager(50, 1.0);
    let (handle, mut receiver) = mgr.create(Uuid::new_v4());

    for i in 0..10u32 {
        handle.push(StreamToken::text(format!("t{i}"), i)).await;
    }
    let mut first_observation = Vec::new();
    for _ in 0..10 {
        first_observation.push(receiver.next().await.unwrap().token_id);
    }

    for i in 10..20u32 {
        handle.push(StreamToken::text(format!("t{i}"), i)).await;
    }
    handle.close(CloseReason::EndOfStream);

    let mut second_observation = first_observation.clone();
    while let Some(token) = receiver.next().await {
        second_observation.push(token.token_id);
    }

    // The later observation extends the earlier one without reordering.
    assert_eq!(second_observation[..10], first_observation[..]);
    assert_eq!(second_observation, (0..20).collect::<Vec<_>>());
}

// ============================================================================
// Idle sweep lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sweeper_closes_idle_then_reaps() {
    let mgr = manager(10, 1.0);
    let (handle, _receiver) = mgr.create(Uuid::new_v4());

    tokio::time::advance(Duration::from_secs(61)).await;
    mgr.sweep();
    assert!(handle.is_closed());
    assert_eq!(mgr.tracked_count(), 1);

    // One retention cycle for late drainers, then gone.
    mgr.sweep();
    assert_eq!(mgr.tracked_count(), 1);
    mgr.sweep();
    assert_eq!(mgr.tracked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn spacing_equal_to_idle_timeout_does_not_close() {
    let mgr = StreamManager::new(StreamConfig {
        buffer_size: 10,
        idle_timeout_s: 2.0,
        push_wait_s: 1.0,
        sweep_interval_s: 10.0,
    });
    let (handle, mut receiver) = mgr.create(Uuid::new_v4());

    let producer = tokio::spawn(async move {
        for i in 0..3u32 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.push(StreamToken::text(format!("t{i}"), i)).await;
        }
        handle.close(CloseReason::EndOfStream);
    });

    let mut seen = Vec::new();
    while let Some(token) = receiver.next().await {
        seen.push(token.token_id);
    }
    producer.await.unwrap();

    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(receiver.close_reason(), CloseReason::EndOfStream);
}

#[tokio::test]
async fn exactly_one_terminal_reason_per_stream() {
    let mgr = manager(10, 1.0);
    let (handle, mut receiver) = mgr.create(Uuid::new_v4());

    handle.push(StreamToken::text("x", 0)).await;
    handle.close(CloseReason::EndOfStream);
    handle.close(CloseReason::RequestTimeout);
    mgr.close(&receiver.request_id(), CloseReason::Shutdown);

    while receiver.next().await.is_some() {}
    assert_eq!(receiver.close_reason(), CloseReason::EndOfStream);
}
