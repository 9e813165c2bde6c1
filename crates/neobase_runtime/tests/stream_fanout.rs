//! Stream bus behavior through the public API: multi-subscriber fan-out,
//! per-stream ordering, and cancellation semantics.

use std::time::Duration;

use serde_json::json;
use neobase_runtime::types::{StreamEventKind, StreamResponse};
use neobase_runtime::{CancelHandle, StreamBus};

fn bus() -> StreamBus {
    StreamBus::new(Duration::from_millis(100), Duration::from_secs(30))
}

#[tokio::test]
async fn streams_of_one_chat_are_independent() {
    let bus = bus();
    let mut a = bus.subscribe("chat", "u1", "stream-a").await;
    let mut b = bus.subscribe("chat", "u1", "stream-b").await;

    bus.publish(
        "chat",
        "stream-a",
        StreamResponse::new(StreamEventKind::AiResponseStep, json!("only for a")),
    )
    .await;

    let got = a.receiver.recv().await.unwrap();
    assert_eq!(got.data, json!("only for a"));
    assert!(b.receiver.try_recv().is_err());
}

#[tokio::test]
async fn events_arrive_in_enqueue_order() {
    let bus = bus();
    let mut sub = bus.subscribe("chat", "u1", "s").await;

    for i in 0..20 {
        bus.publish(
            "chat",
            "s",
            StreamResponse::new(StreamEventKind::AiResponseStep, json!(i)),
        )
        .await;
    }
    for i in 0..20 {
        assert_eq!(sub.receiver.recv().await.unwrap().data, json!(i));
    }
}

#[tokio::test]
async fn cancel_signal_reaches_workers_bound_to_the_stream() {
    let bus = bus();
    let sub = bus.subscribe("chat", "u1", "s").await;
    let worker_handle = sub.cancel.clone();

    let worker = tokio::spawn(async move {
        tokio::select! {
            _ = worker_handle.cancelled() => "cancelled",
            _ = tokio::time::sleep(Duration::from_secs(5)) => "timed out",
        }
    });

    bus.cancel("chat", "s").await;
    assert_eq!(worker.await.unwrap(), "cancelled");
}

#[tokio::test]
async fn completion_closes_and_subsequent_publishes_are_dropped() {
    let bus = bus();
    let mut sub = bus.subscribe("chat", "u1", "s").await;

    bus.complete("chat", "s").await;
    assert_eq!(
        sub.receiver.recv().await.unwrap().event,
        StreamEventKind::Complete
    );
    assert!(sub.receiver.recv().await.is_none());

    // Publishing after completion must not error or block.
    bus.publish(
        "chat",
        "s",
        StreamResponse::new(StreamEventKind::AiResponse, json!({})),
    )
    .await;
}

#[tokio::test]
async fn fresh_cancel_handle_is_not_cancelled() {
    let handle = CancelHandle::new();
    assert!(!handle.is_cancelled());
    assert!(handle.check().is_ok());
    handle.cancel();
    assert!(handle.check().is_err());
}
