//! Single-flight and parallelism tests
//!
//! Covers:
//! - Tasks for one destination run strictly one after another
//! - Different destinations play in parallel
//! - Worker slot limit bounds concurrent pipelines

mod helpers;

use helpers::*;
use std::collections::HashMap;
use std::time::Duration;
use vcmw_common::events::WorkerEvent;
use vcmw_common::{DestinationId, TaskStatus};

#[tokio::test]
async fn test_second_task_waits_for_first_to_finish() {
    let worker = TestWorker::new().await;
    let mut rx = worker.events();
    let a = worker.enqueue(DEST, "song A").await;
    let b = worker.enqueue(DEST, "song B").await;

    let handle = worker.spawn_loop();

    let mut seen = Vec::new();
    wait_for_event(&mut rx, &mut seen, is_started(a)).await;
    // A is playing: B must still be queued
    assert_eq!(worker.task(b).await.status, TaskStatus::Pending);

    wait_for_event(&mut rx, &mut seen, is_finished(b)).await;
    worker.orchestrator.shutdown();
    handle.await.unwrap().unwrap();

    let position = |pred: &dyn Fn(&WorkerEvent) -> bool| {
        seen.iter().position(|e| pred(e)).expect("event seen")
    };
    let a_ended = position(&|e| matches!(e, WorkerEvent::PlaybackEnded { task_id, .. } if *task_id == a));
    let b_claimed = position(&|e| matches!(e, WorkerEvent::TaskClaimed { task_id, .. } if *task_id == b));
    assert!(a_ended < b_claimed, "B was claimed while A still held the destination");

    assert_eq!(worker.task(a).await.status, TaskStatus::Completed);
    assert_eq!(worker.task(b).await.status, TaskStatus::Completed);

    // The first task joined; the call was still up for the second
    assert_eq!(
        worker.voice.calls(),
        vec![VoiceCall::Join(DEST), VoiceCall::Replace(DEST)]
    );
}

#[tokio::test]
async fn test_same_destination_never_overlaps() {
    let worker = TestWorker::new().await;
    worker.fetcher.set_delay(Duration::from_millis(20));
    worker.fetcher.set_duration(Some(Duration::from_millis(20)));

    let mut ids = Vec::new();
    for i in 0..6 {
        let destination = if i % 2 == 0 { DEST } else { OTHER };
        ids.push(worker.enqueue(destination, &format!("song {}", i)).await);
    }

    let mut rx = worker.events();
    let handle = worker.spawn_loop();
    for id in &ids {
        assert_eq!(worker.wait_terminal(*id).await.status, TaskStatus::Completed);
    }
    worker.orchestrator.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(worker.fetcher.max_in_flight(DEST), 1);
    assert_eq!(worker.fetcher.max_in_flight(OTHER), 1);

    // Per destination, playback windows never interleave
    let mut playing: HashMap<DestinationId, usize> = HashMap::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkerEvent::PlaybackStarted { destination, .. } => {
                let count = playing.entry(destination).or_insert(0);
                *count += 1;
                assert_eq!(*count, 1, "two pipelines playing in {}", destination);
            }
            WorkerEvent::PlaybackEnded { destination, .. } => {
                *playing.entry(destination).or_insert(1) -= 1;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_different_destinations_play_in_parallel() {
    let worker = TestWorker::new().await;
    worker.fetcher.set_delay(Duration::from_millis(200));
    let a = worker.enqueue(DEST, "song A").await;
    let b = worker.enqueue(OTHER, "song B").await;

    let handle = worker.spawn_loop();
    worker.wait_terminal(a).await;
    worker.wait_terminal(b).await;
    worker.orchestrator.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(worker.fetcher.max_global(), 2);
}

#[tokio::test]
async fn test_worker_slots_bound_concurrency() {
    let mut settings = fast_settings();
    settings.max_concurrent_pipelines = 1;
    let worker = TestWorker::with_settings(settings).await;
    worker.fetcher.set_delay(Duration::from_millis(50));

    let a = worker.enqueue(DEST, "song A").await;
    let b = worker.enqueue(OTHER, "song B").await;

    let handle = worker.spawn_loop();
    worker.wait_terminal(a).await;
    worker.wait_terminal(b).await;
    worker.orchestrator.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(worker.fetcher.max_global(), 1);
}
