//! End-to-end RPC behavior over the in-memory broker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::json;

use common::*;
use queue_rpc::error::RpcError;
use queue_rpc::messaging::{PublishProperties, Transport};
use queue_rpc::server::{handler_fn, typed_handler};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct AddResponse {
    sum: i64,
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = RpcHarness::start(
        test_config(),
        vec![("echo", handler_fn(|data| async move { Ok(Some(data)) }))],
    )
    .await;

    let reply = harness.client.call("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(reply, json!({"x": 1}));

    assert!(wait_until(|| harness.work_queue_stats().total_acked == 1).await);
    let stats = harness.server.get_stats();
    assert_eq!(stats.get_received(), 1);
    assert_eq!(stats.get_acked(), 1);
    assert_eq!(stats.get_rejected(), 0);
    assert_eq!(stats.get_replies_published(), 1);
    assert_eq!(harness.client.pending_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_remote_function_and_typed_calls() {
    let harness = RpcHarness::start(
        test_config(),
        vec![(
            "add",
            typed_handler(|req: AddRequest| async move {
                Ok(AddResponse { sum: req.a + req.b })
            }),
        )],
    )
    .await;

    let add = harness.client.get_function("add");
    let reply = add.call(json!({"a": 2, "b": 40})).await.unwrap();
    assert_eq!(reply, json!({"sum": 42}));

    let typed: AddResponse = harness
        .client
        .call_typed("add", &AddRequest { a: -1, b: 1 })
        .await
        .unwrap();
    assert_eq!(typed, AddResponse { sum: 0 });

    let via_function: AddResponse = add.call_typed(&AddRequest { a: 5, b: 5 }).await.unwrap();
    assert_eq!(via_function.sum, 10);

    harness.stop().await;
}

#[tokio::test]
async fn test_failing_handler_is_rejected_once_without_reply() {
    let harness = RpcHarness::start(
        test_config(),
        vec![(
            "divide",
            handler_fn(|_| async { Err(anyhow!("division by zero")) }),
        )],
    )
    .await;

    let err = harness
        .client
        .call("divide", json!({"n": 1, "d": 0}))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { ref name, .. } if name == "divide"));

    let queue = harness.work_queue_stats();
    assert_eq!(queue.total_rejected, 1);
    assert_eq!(queue.total_acked, 0);
    assert_eq!(queue.unacked_count, 0);
    assert_eq!(harness.server.get_stats().get_replies_published(), 0);
    assert_eq!(harness.client.get_stats().get_timed_out(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_handler_does_not_stop_dispatch() {
    let harness = RpcHarness::start(
        test_config(),
        vec![("echo", handler_fn(|data| async move { Ok(Some(data)) }))],
    )
    .await;

    let err = harness.client.call("missing", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    // Later messages are still processed
    let reply = harness.client.call("echo", json!("still here")).await.unwrap();
    assert_eq!(reply, json!("still here"));

    let stats = harness.server.get_stats();
    assert_eq!(stats.get_rejected(), 1);
    assert!(wait_until(|| harness.server.get_stats().get_acked() == 1).await);
    assert!(harness.server.is_running());

    harness.stop().await;
}

#[tokio::test]
async fn test_malformed_call_is_rejected() {
    let harness = RpcHarness::start(
        test_config(),
        vec![("echo", handler_fn(|data| async move { Ok(Some(data)) }))],
    )
    .await;

    let producer = harness.broker.transport();
    producer
        .publish(TEST_QUEUE, b"not json at all", PublishProperties::default())
        .await
        .unwrap();

    assert!(wait_until(|| harness.server.get_stats().get_rejected() == 1).await);

    let reply = harness.client.call("echo", json!(7)).await.unwrap();
    assert_eq!(reply, json!(7));

    harness.stop().await;
}

#[tokio::test]
async fn test_fire_and_forget_resolves_by_timeout_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let harness = RpcHarness::start(
        test_config(),
        vec![(
            "notify",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        )],
    )
    .await;

    let err = harness.client.call("notify", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.work_queue_stats().total_acked, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_every_delivery_gets_exactly_one_disposition() {
    let harness = RpcHarness::start(
        test_config(),
        vec![
            ("echo", handler_fn(|data| async move { Ok(Some(data)) })),
            ("fail", handler_fn(|_| async { Err(anyhow!("nope")) })),
        ],
    )
    .await;

    let client = harness.client.clone();
    let mut calls = Vec::new();
    for i in 0..6 {
        let client = client.clone();
        let name = if i % 2 == 0 { "echo" } else { "fail" };
        calls.push(tokio::spawn(async move { client.call(name, json!(i)).await }));
    }

    let mut resolved = 0;
    for call in calls {
        if call.await.unwrap().is_ok() {
            resolved += 1;
        }
    }
    assert_eq!(resolved, 3);

    assert!(wait_until(|| harness.work_queue_stats().unacked_count == 0).await);
    let queue = harness.work_queue_stats();
    assert_eq!(queue.total_delivered, 6);
    assert_eq!(queue.total_acked + queue.total_rejected, 6);
    assert_eq!(queue.total_acked, 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_reply_queue_is_private_to_each_client() {
    let harness = RpcHarness::start(
        test_config(),
        vec![("echo", handler_fn(|data| async move { Ok(Some(data)) }))],
    )
    .await;

    let second = queue_rpc::client::CallTracker::new(
        Arc::new(harness.broker.transport()),
        &harness.config,
    )
    .await
    .unwrap();
    assert_ne!(second.reply_queue(), harness.client.reply_queue());

    let (a, b) = tokio::join!(
        harness.client.call("echo", json!("first")),
        second.call("echo", json!("second")),
    );
    assert_eq!(a.unwrap(), json!("first"));
    assert_eq!(b.unwrap(), json!("second"));

    second.shutdown().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_structured_logging_initializes_once() {
    queue_rpc::logging::init_structured_logging();
    queue_rpc::logging::init_structured_logging();

    let harness = RpcHarness::start(
        test_config(),
        vec![("echo", handler_fn(|data| async move { Ok(Some(data)) }))],
    )
    .await;
    assert_eq!(
        harness.client.call("echo", json!(null)).await.unwrap(),
        json!(null)
    );
    harness.stop().await;
}
