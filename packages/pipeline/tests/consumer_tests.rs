#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, count, publish, settings};
use ingest_core::{
    BlobReference, Disposition, IngestEvent, LedgerEntry, MessageState, ProcessedLedger,
};
use message_queue::MessageQueue;
use pipeline::{Actor, ConsumerActor};
use tokio::sync::Semaphore;

fn is_acked(e: &IngestEvent) -> bool {
    matches!(e, IngestEvent::MessageAcknowledged { .. })
}

fn is_failed(e: &IngestEvent) -> bool {
    matches!(e, IngestEvent::MessageFailed { .. })
}

#[tokio::test]
async fn test_success_is_recorded_then_acknowledged() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    let blob = publish(&h.storage, &h.queue, "club/2024-06-01.csv", "court 1,6-3 6-4\ncourt 2,7-5 6-2").await;

    let in_flight = Arc::new(Semaphore::new(4));
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    let events = h.wait_for(is_acked).await;
    match events.last() {
        Some(IngestEvent::MessageAcknowledged { blob: acked, consumer_id, .. }) => {
            assert_eq!(acked, &blob);
            assert_eq!(consumer_id, "c-1");
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(h.queue.is_empty().await);
    assert_eq!(h.processor.seen().len(), 1);
    let message_id = events
        .iter()
        .find_map(|e| e.message_id().cloned())
        .ok_or("no message id")?;
    let entry = h.ledger.lookup(&message_id).await?.ok_or("not recorded")?;
    assert_eq!(entry.disposition, Disposition::Applied);
    assert_eq!(entry.blob, Some(blob));

    h.shutdown.cancel();
    handle.await?;
    assert_eq!(in_flight.available_permits(), 4);
    Ok(())
}

#[tokio::test]
async fn test_failed_processing_never_deletes() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    publish(&h.storage, &h.queue, "transient.csv", "fail-transient").await;
    publish(&h.storage, &h.queue, "permanent.csv", "fail-permanent").await;

    let in_flight = Arc::new(Semaphore::new(4));
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    let mut events = h.wait_for(is_failed).await;
    events.extend(h.wait_for(is_failed).await);

    let outcomes: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            IngestEvent::MessageFailed { outcome, .. } => Some(outcome.is_retryable()),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.contains(&true) && outcomes.contains(&false));

    // Both still on the queue, leased until their windows lapse.
    assert_eq!(h.queue.len().await, 2);
    for event in &events {
        if let Some(id) = event.message_id() {
            assert_eq!(h.queue.state_of(id).await, Some(MessageState::Received));
        }
    }
    assert!(h.ledger.is_empty());

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_malformed_body_is_a_permanent_failure() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    h.queue.send(r#"{"unexpected":"shape"}"#.into()).await?;

    let in_flight = Arc::new(Semaphore::new(1));
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    let events = h.wait_for(is_failed).await;
    assert!(matches!(
        events.last(),
        Some(IngestEvent::MessageFailed { outcome, .. }) if !outcome.is_retryable()
    ));
    assert!(h.processor.seen().is_empty());

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_blob_is_dead_lettered_once_after_the_ceiling() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    let body = BlobReference::new(common::BUCKET, "deleted-before-processing.csv").to_message_body();
    h.queue.send(body.clone()).await?;

    let mut cfg = settings();
    cfg.max_receive_count = 2;
    let in_flight = Arc::new(Semaphore::new(1));
    let (_actor, handle) = Actor::spawn(None, ConsumerActor, h.consumer("c-1", cfg, &in_flight)).await?;

    let mut events = h.wait_for(|e| matches!(e, IngestEvent::MessageDeadLettered { .. })).await;
    // Give the consumer time to misbehave if it were going to.
    tokio::time::sleep(Duration::from_secs(120)).await;
    events.extend(h.drain_events());

    assert_eq!(count(&events, is_failed), 2);
    assert_eq!(
        count(&events, |e| matches!(e, IngestEvent::MessageDeadLettered { receive_count: 3, .. })),
        1
    );
    assert_eq!(h.dead_letters.bodies().await, vec![body]);
    assert!(h.queue.is_empty().await);
    assert!(h.processor.seen().is_empty());

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_redelivered_applied_message_is_not_reprocessed() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    let blob = BlobReference::new(common::BUCKET, "already-applied.csv");
    let id = h.queue.send(blob.to_message_body()).await?;
    h.ledger.record(LedgerEntry::applied(id.clone(), blob)).await?;

    let in_flight = Arc::new(Semaphore::new(1));
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    h.wait_for(|e| matches!(e, IngestEvent::DuplicateSuppressed { .. })).await;
    // The delete happens right after the event.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.processor.seen().is_empty());
    assert_eq!(h.queue.state_of(&id).await, Some(MessageState::Acknowledged));

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn test_previously_dead_lettered_message_is_only_deleted() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    let id = h.queue.send("not even json".into()).await?;
    h.ledger.record(LedgerEntry::dead_lettered(id.clone(), None)).await?;

    let in_flight = Arc::new(Semaphore::new(1));
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    h.wait_for(|e| matches!(e, IngestEvent::MessageReceived { .. })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.queue.state_of(&id).await, Some(MessageState::Acknowledged));
    assert!(h.dead_letters.is_empty().await);
    assert_eq!(count(&h.drain_events(), |e| matches!(e, IngestEvent::MessageDeadLettered { .. })), 0);

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_the_window_yields_one_successful_delete() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    publish(&h.storage, &h.queue, "slow.csv", "sleep:45").await;

    let mut cfg = settings();
    cfg.batch_size = 1;
    cfg.processing_timeout = Duration::from_secs(60);
    let in_flight = Arc::new(Semaphore::new(2));
    let (_a, first) = Actor::spawn(None, ConsumerActor, h.consumer("c-1", cfg, &in_flight)).await?;
    let (_b, second) = Actor::spawn(None, ConsumerActor, h.consumer("c-2", cfg, &in_flight)).await?;

    tokio::time::sleep(Duration::from_secs(180)).await;
    let events = h.drain_events();

    assert!(h.queue.is_empty().await);
    // The second delivery started while the first was still processing.
    assert!(h.processor.seen().len() >= 2);
    assert!(count(&events, |e| matches!(e, IngestEvent::AcknowledgementRaced { .. })) >= 1);
    assert!(count(&events, is_acked) <= 1);

    h.shutdown.cancel();
    first.await?;
    second.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_a_slow_message_leased() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    publish(&h.storage, &h.queue, "slow.csv", "sleep:20").await;

    let mut cfg = settings();
    cfg.batch_size = 1;
    cfg.visibility_timeout = Duration::from_secs(6);
    cfg.processing_timeout = Duration::from_secs(60);
    cfg.extend_visibility = true;
    let in_flight = Arc::new(Semaphore::new(2));
    let (_a, first) = Actor::spawn(None, ConsumerActor, h.consumer("c-1", cfg, &in_flight)).await?;
    let (_b, second) = Actor::spawn(None, ConsumerActor, h.consumer("c-2", cfg, &in_flight)).await?;

    let events = h.wait_for(is_acked).await;

    assert_eq!(count(&events, |e| matches!(e, IngestEvent::MessageReceived { .. })), 1);
    assert_eq!(h.processor.seen().len(), 1);
    assert!(h.queue.is_empty().await);

    h.shutdown.cancel();
    first.await?;
    second.await?;
    Ok(())
}

#[tokio::test]
async fn test_in_flight_limit_caps_the_batch() -> Result<(), Box<dyn Error>> {
    let mut h = Harness::new().await;
    for n in 0..5 {
        publish(&h.storage, &h.queue, &format!("r{n}.csv"), "sleep:1").await;
    }

    // Two permits held elsewhere leave room for one message at a time.
    let in_flight = Arc::new(Semaphore::new(3));
    let _held = in_flight.clone().acquire_many_owned(2).await?;
    let (_actor, handle) =
        Actor::spawn(None, ConsumerActor, h.consumer("c-1", settings(), &in_flight)).await?;

    h.wait_for(|e| matches!(e, IngestEvent::MessageReceived { .. })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(in_flight.available_permits(), 0);
    assert_eq!(h.processor.seen().len(), 1);
    assert_eq!(h.queue.len().await, 5);

    h.shutdown.cancel();
    handle.await?;
    Ok(())
}
