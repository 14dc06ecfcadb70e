//! Queue worker behavior: concurrency bound, prefetch backpressure,
//! acknowledgement, and graceful shutdown.

mod common;

use std::time::Duration;

use common::{collect_events, collect_outcomes, wait_until, Harness, ScriptedEncoder};
use transcoda_jobs::{JobQueue, JobStore, RequestStatus, WorkerConfig, WorkerEvent};

fn config(consumers: usize) -> WorkerConfig {
    WorkerConfig::default()
        .with_consumers(consumers)
        .with_prefetch(1)
        .with_queue_name("test")
}

#[tokio::test]
async fn test_worker_completes_submitted_jobs() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    let mut ids = Vec::new();
    for name in ["a.mp3", "b.mp3", "c.mp3"] {
        ids.push(h.submit(name, "wav").await);
    }

    let worker = h.worker(2, config(2));
    let mut events = worker.events();
    let handle = worker.start();

    let seen = collect_outcomes(&mut events, 3).await;
    assert_eq!(seen[0], WorkerEvent::WorkerStarted);
    let completed = seen
        .iter()
        .filter(|e| matches!(e, WorkerEvent::JobCompleted { .. }))
        .count();
    assert_eq!(completed, 3);

    for id in &ids {
        let request = h.store.get_request(*id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Done);
        assert!(request.target_id.is_some());
    }
    assert_eq!(h.queue.acked(), 3);
    assert_eq!(h.queue.depth().await.unwrap().total(), 0);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_limiter_caps_concurrent_encodes() {
    let (encoder, gate) = ScriptedEncoder::gated();
    let h = Harness::new(encoder).await;
    for name in ["a.mp3", "b.mp3", "c.mp3"] {
        h.submit(name, "wav").await;
    }

    // More consumers than slots: the limiter is what holds the third job back.
    let worker = h.worker(2, config(3));
    let mut events = worker.events();
    let handle = worker.start();

    let encoder = h.encoder.clone();
    wait_until(|| encoder.active() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.encoder.active(), 2);
    assert_eq!(h.encoder.calls(), 2);

    gate.add_permits(3);
    collect_outcomes(&mut events, 3).await;
    assert_eq!(h.encoder.calls(), 3);
    assert_eq!(h.encoder.max_active(), 2);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_consumer_holds_one_unacked_message() {
    let (encoder, gate) = ScriptedEncoder::gated();
    let h = Harness::new(encoder).await;
    h.submit("a.mp3", "wav").await;
    h.submit("b.mp3", "wav").await;

    // Plenty of limiter slots, a single consumer with prefetch 1.
    let worker = h.worker(5, config(1));
    let mut events = worker.events();
    let handle = worker.start();

    let encoder = h.encoder.clone();
    wait_until(|| encoder.active() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let depth = h.queue.depth().await.unwrap();
    assert_eq!(depth.in_flight, 1);
    assert_eq!(depth.ready, 1);
    assert_eq!(h.encoder.calls(), 1);

    gate.add_permits(2);
    collect_outcomes(&mut events, 2).await;
    assert_eq!(h.encoder.max_active(), 1);
    assert_eq!(h.queue.acked(), 2);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_acked_and_reported() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    let request_id = h.submit("track.mp3", common::UNSUPPORTED_FORMAT).await;

    let worker = h.worker(1, config(1));
    let mut events = worker.events();
    let handle = worker.start();

    let seen = collect_outcomes(&mut events, 1).await;
    match seen.last() {
        Some(WorkerEvent::JobFailed { request_id: id, error }) => {
            assert_eq!(*id, request_id);
            assert!(error.contains("Conversion error"), "{}", error);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::Failed
    );
    assert_eq!(h.queue.acked(), 1);
    assert_eq!(h.queue.depth().await.unwrap().total(), 0);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_is_rejected_and_acked() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    h.queue.push_raw(b"{\"FileID\": 42".to_vec());
    let request_id = h.submit("track.mp3", "wav").await;

    let worker = h.worker(1, config(1));
    let mut events = worker.events();
    let handle = worker.start();

    let seen = collect_outcomes(&mut events, 1).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, WorkerEvent::MessageRejected { .. })));
    assert!(seen.iter().any(
        |e| matches!(e, WorkerEvent::JobCompleted { request_id: id, .. } if *id == request_id)
    ));
    assert_eq!(h.queue.acked(), 2);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_redelivered_terminal_request_is_skipped() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    let request_id = h.submit("track.mp3", "wav").await;
    h.store
        .update_request_status(request_id, RequestStatus::Processing, None)
        .await
        .unwrap();
    h.store
        .update_request_status(request_id, RequestStatus::Failed, None)
        .await
        .unwrap();

    let worker = h.worker(1, config(1));
    let mut events = worker.events();
    let handle = worker.start();

    let seen = collect_outcomes(&mut events, 1).await;
    assert_eq!(
        seen.last(),
        Some(&WorkerEvent::JobSkipped {
            request_id,
            status: RequestStatus::Failed
        })
    );
    assert_eq!(h.encoder.calls(), 0);
    assert_eq!(h.queue.acked(), 1);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_job() {
    let (encoder, gate) = ScriptedEncoder::gated();
    let h = Harness::new(encoder).await;
    let first = h.submit("a.mp3", "wav").await;
    let second = h.submit("b.mp3", "wav").await;

    let worker = h.worker(1, config(1));
    let mut events = worker.events();
    let handle = worker.start();

    let encoder = h.encoder.clone();
    wait_until(|| encoder.active() == 1).await;
    handle.shutdown();

    let join = tokio::spawn(handle.join());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!join.is_finished(), "shutdown must wait for the running job");

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();

    let seen = collect_events(&mut events, |seen| {
        seen.last() == Some(&WorkerEvent::WorkerStopped)
    })
    .await;
    assert!(seen.iter().any(
        |e| matches!(e, WorkerEvent::JobCompleted { request_id, .. } if *request_id == first)
    ));

    assert_eq!(
        h.store.get_request(first).await.unwrap().status,
        RequestStatus::Done
    );
    // Never started, still waiting in the queue for the next worker.
    assert_eq!(
        h.store.get_request(second).await.unwrap().status,
        RequestStatus::Queued
    );
    let depth = h.queue.depth().await.unwrap();
    assert_eq!(depth.ready, 1);
    assert_eq!(depth.in_flight, 0);
}

#[tokio::test]
async fn test_worker_stops_when_queue_closes() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    h.submit("a.mp3", "wav").await;
    h.queue.close();

    let worker = h.worker(2, config(2));
    let mut events = worker.events();
    let handle = worker.start();

    let seen = collect_events(&mut events, |seen| {
        seen.last() == Some(&WorkerEvent::WorkerStopped)
    })
    .await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, WorkerEvent::JobCompleted { .. })));
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_disabled_worker_does_nothing() {
    let h = Harness::new(ScriptedEncoder::new()).await;
    h.submit("a.mp3", "wav").await;

    let handle = h.worker(1, config(1).with_enabled(false)).start();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("disabled worker should exit at once")
        .unwrap();
    assert_eq!(h.queue.depth().await.unwrap().ready, 1);
    assert_eq!(h.encoder.calls(), 0);
}
