//! # Call Tracker
//!
//! Client role of the RPC protocol. Each call gets a fresh correlation token
//! and a pending entry, is published to the shared queue with the tracker's
//! private reply queue as its reply destination, and completes when the reply
//! loop matches a reply carrying the same token.
//!
//! ## Background tasks
//!
//! - **Reply loop**: consumes the private reply queue, resolves or rejects the
//!   matching pending call, and acks or rejects the reply
//! - **Timeout sweeper**: periodically rejects calls past their deadline with
//!   [`RpcError::Timeout`]; not started when calls are unbounded
//!
//! Both tasks stop on [`CallTracker::shutdown`] or when the last handle to the
//! tracker is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::pending::{PendingCall, PendingCalls, PendingGuard};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::logging::RpcLogger;
use crate::messaging::{Delivery, DeliveryStream, PublishProperties, QueueOptions, Transport};
use crate::protocol::{
    decode_value, from_structured, to_structured, CorrelationId, FunctionCall, StructuredValue,
};

const COMPONENT: &str = "call tracker";

/// Statistics for call tracker observability
#[derive(Debug, Default)]
pub struct TrackerStats {
    /// Calls registered in the pending table
    pub calls: AtomicU64,
    /// Calls resolved with a decoded reply
    pub resolved: AtomicU64,
    /// Calls rejected by a decode, publish, or shutdown failure
    pub rejected: AtomicU64,
    /// Calls rejected by the timeout sweeper
    pub timed_out: AtomicU64,
    /// Replies whose token matched no pending call
    pub unmatched: AtomicU64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn get_resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    pub fn get_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn get_timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn get_unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

/// State shared by callers and the background tasks
struct TrackerShared {
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    logger: RpcLogger,
    stats: Arc<TrackerStats>,
    closed: AtomicBool,
}

impl TrackerShared {
    /// Match one reply to its pending call and settle both
    async fn handle_reply(&self, delivery: Delivery) {
        let call = delivery
            .correlation_id
            .as_deref()
            .map(CorrelationId::from)
            .and_then(|token| self.pending.take(&token));

        let Some(call) = call else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = ?delivery.correlation_id,
                queue = %delivery.queue_name,
                "Discarding reply with no matching pending call"
            );
            self.settle(&delivery, false).await;
            return;
        };

        match decode_value(&delivery.payload) {
            Ok(value) => {
                self.logger.message(
                    "reply",
                    &format!(
                        "Reply for '{}' after {:?}: {}",
                        call.name,
                        call.created_at.elapsed(),
                        delivery.payload_text()
                    ),
                );
                self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                call.complete(Ok(value));
                self.settle(&delivery, true).await;
            }
            Err(e) => {
                self.logger
                    .error("decode", &e, Some(delivery.payload_text().as_str()));
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                call.complete(Err(e));
                self.settle(&delivery, false).await;
            }
        }
    }

    /// Ack or reject-without-requeue a reply
    async fn settle(&self, delivery: &Delivery, ack: bool) {
        let result = if ack {
            self.transport.ack(delivery).await
        } else {
            self.transport.reject(delivery, false).await
        };

        if let Err(e) = result {
            warn!(receipt = %delivery.receipt_handle, error = %e, "Failed to settle reply");
            self.logger.error(if ack { "ack" } else { "reject" }, &e, None);
        }
    }

    /// Reject every call whose deadline has passed
    fn expire(&self, now: Instant) {
        for (token, call) in self.pending.take_expired(now) {
            let timeout_ms = call
                .deadline
                .map(|deadline| deadline.duration_since(call.created_at).as_millis() as u64)
                .unwrap_or(0);
            let err = RpcError::timeout(call.name.clone(), token.to_string(), timeout_ms);

            self.logger.error("timeout", &err, None);
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            call.complete(Err(err));
        }
    }

    /// Reject every remaining call with `Closed`
    fn close_pending(&self) -> usize {
        let remaining = self.pending.drain();
        let count = remaining.len();
        for (_, call) in remaining {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            call.complete(Err(RpcError::closed(COMPONENT)));
        }
        count
    }
}

struct TrackerInner {
    shared: Arc<TrackerShared>,
    queue_name: String,
    reply_queue: String,
    call_timeout: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackerInner {
    async fn call(&self, name: &str, data: StructuredValue) -> Result<StructuredValue> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::closed(COMPONENT));
        }

        let payload = FunctionCall::new(name, data).encode()?;
        let token = CorrelationId::generate();
        let (sender, receiver) = oneshot::channel();
        let now = Instant::now();

        shared.pending.insert(
            token.clone(),
            PendingCall {
                name: name.to_string(),
                sender,
                deadline: self.call_timeout.map(|timeout| now + timeout),
                created_at: now,
            },
        );
        // Dropping the caller's future abandons the entry
        let mut guard = PendingGuard::new(&shared.pending, token.clone());
        shared.stats.calls.fetch_add(1, Ordering::Relaxed);

        if shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::closed(COMPONENT));
        }

        shared.logger.message(
            "call",
            &format!("Calling '{name}' with correlation_id {token}"),
        );

        if let Err(e) = shared
            .transport
            .publish(
                &self.queue_name,
                &payload,
                PublishProperties::call(self.reply_queue.as_str(), token.as_str()),
            )
            .await
        {
            shared
                .logger
                .error("publish", &e, Some(&*String::from_utf8_lossy(&payload)));
            if shared.pending.take(&token).is_some() {
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
            guard.disarm();
            return Err(e);
        }

        let outcome = receiver.await;
        guard.disarm();
        outcome.unwrap_or_else(|_| Err(RpcError::closed(COMPONENT)))
    }
}

/// RPC client with a private reply queue
///
/// Cheap to clone; clones share the pending table and background tasks.
#[derive(Clone)]
pub struct CallTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for CallTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTracker")
            .field("queue_name", &self.inner.queue_name)
            .field("reply_queue", &self.inner.reply_queue)
            .field("call_timeout", &self.inner.call_timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CallTracker {
    /// Declare a private reply queue on `transport` and start the reply loop
    ///
    /// The shared queue is declared too, so calls made before any server
    /// starts are queued rather than dropped.
    pub async fn new(transport: Arc<dyn Transport>, config: &RpcConfig) -> Result<Self> {
        config.validate()?;

        transport
            .declare_queue(&config.queue_name, QueueOptions::shared())
            .await?;
        let reply_queue = transport
            .declare_queue("", QueueOptions::private_reply())
            .await?;
        let stream = transport.consume(&reply_queue).await?;

        let shared = Arc::new(TrackerShared {
            transport,
            pending: PendingCalls::new(),
            logger: RpcLogger::new(COMPONENT, config.options),
            stats: Arc::new(TrackerStats::new()),
            closed: AtomicBool::new(false),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(reply_loop(
            shared.clone(),
            stream,
            shutdown_tx.subscribe(),
        ))];

        let call_timeout = config.call_timeout();
        if call_timeout.is_some() {
            tasks.push(tokio::spawn(sweep_loop(
                shared.clone(),
                config.sweep_interval(),
                shutdown_tx.subscribe(),
            )));
        }

        info!(
            queue = %config.queue_name,
            reply_queue = %reply_queue,
            call_timeout = ?call_timeout,
            provider = shared.transport.provider_name(),
            "RPC call tracker started"
        );

        Ok(Self {
            inner: Arc::new(TrackerInner {
                shared,
                queue_name: config.queue_name.clone(),
                reply_queue,
                call_timeout,
                shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Invoke the remote function `name` with `data` and await its reply
    pub async fn call(&self, name: &str, data: StructuredValue) -> Result<StructuredValue> {
        self.inner.call(name, data).await
    }

    /// Invoke with a typed request and decode the reply into `Resp`
    pub async fn call_typed<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = to_structured(request)?;
        from_structured(self.call(name, data).await?)
    }

    /// Callable bound to one remote function name
    pub fn get_function(&self, name: impl Into<String>) -> RemoteFunction {
        RemoteFunction {
            inner: self.inner.clone(),
            name: name.into(),
        }
    }

    /// Number of calls awaiting a terminal event
    pub fn pending_count(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Server-named private reply queue
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Get tracker statistics
    pub fn get_stats(&self) -> Arc<TrackerStats> {
        self.inner.shared.stats.clone()
    }

    /// Stop the background tasks, reject pending calls with `Closed`, and
    /// close the transport
    pub async fn shutdown(&self) -> Result<()> {
        let shared = &self.inner.shared;
        shared.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Call tracker task ended abnormally");
            }
        }

        let rejected = shared.close_pending();
        info!(
            reply_queue = %self.inner.reply_queue,
            rejected_pending = rejected,
            "RPC call tracker stopped"
        );

        shared.transport.close().await
    }
}

/// A remote function bound to its name
///
/// Equivalent to calling [`CallTracker::call`] with a fixed name.
#[derive(Clone)]
pub struct RemoteFunction {
    inner: Arc<TrackerInner>,
    name: String,
}

impl std::fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("name", &self.name)
            .finish()
    }
}

impl RemoteFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, data: StructuredValue) -> Result<StructuredValue> {
        self.inner.call(&self.name, data).await
    }

    pub async fn call_typed<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = to_structured(request)?;
        from_structured(self.call(data).await?)
    }
}

async fn reply_loop(
    shared: Arc<TrackerShared>,
    mut stream: DeliveryStream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(delivery) => shared.handle_reply(delivery).await,
            None => {
                shared.closed.store(true, Ordering::SeqCst);
                shared.logger.error("consume", &"consumer cancelled", None);
                let rejected = shared.close_pending();
                warn!(
                    rejected_pending = rejected,
                    "RPC reply consumer cancelled by broker"
                );
                break;
            }
        }
    }
    debug!("RPC reply loop exited");
}

async fn sweep_loop(
    shared: Arc<TrackerShared>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => shared.expire(Instant::now()),
        }
    }
    debug!("RPC timeout sweeper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBroker;
    use serde_json::json;

    fn config() -> RpcConfig {
        RpcConfig::new("memory", "work")
    }

    #[tokio::test]
    async fn test_new_declares_private_reply_queue() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();

        assert!(tracker.reply_queue().starts_with("amq.gen-"));
        assert!(broker.has_queue(tracker.reply_queue()));
        assert!(broker.has_queue("work"));
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_publishes_envelope_with_properties() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();

        let server_side = broker.transport();
        let mut work = server_side.consume("work").await.unwrap();

        let caller = tracker.clone();
        let call = tokio::spawn(async move { caller.call("echo", json!({"x": 1})).await });

        let delivery = work.next().await.unwrap();
        let envelope = FunctionCall::decode(&delivery.payload).unwrap();
        assert_eq!(envelope, FunctionCall::new("echo", json!({"x": 1})));
        assert_eq!(delivery.reply_to.as_deref(), Some(tracker.reply_queue()));
        assert!(delivery.correlation_id.is_some());
        assert_eq!(tracker.pending_count(), 1);

        server_side
            .publish(
                tracker.reply_queue(),
                br#"{"x":1}"#,
                PublishProperties::reply(delivery.correlation_id.clone()),
            )
            .await
            .unwrap();
        server_side.ack(&delivery).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({"x": 1}));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.get_stats().get_resolved(), 1);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_reply_rejects_call() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();
        let server_side = broker.transport();
        let mut work = server_side.consume("work").await.unwrap();

        let caller = tracker.clone();
        let call = tokio::spawn(async move { caller.call("broken", json!(null)).await });

        let delivery = work.next().await.unwrap();
        server_side
            .publish(
                tracker.reply_queue(),
                b"{not json",
                PublishProperties::reply(delivery.correlation_id.clone()),
            )
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Decode { .. }));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.get_stats().get_rejected(), 1);

        let mut rejected = 0;
        for _ in 0..100 {
            rejected = broker
                .queue_stats(tracker.reply_queue())
                .map(|s| s.total_rejected)
                .unwrap_or(0);
            if rejected == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rejected, 1);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_rejected() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();

        let other = broker.transport();
        other
            .publish(
                tracker.reply_queue(),
                b"1",
                PublishProperties::reply(Some("nobody".to_string())),
            )
            .await
            .unwrap();
        other
            .publish(tracker.reply_queue(), b"2", PublishProperties::default())
            .await
            .unwrap();

        let stats = tracker.get_stats();
        for _ in 0..100 {
            if stats.get_unmatched() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stats.get_unmatched(), 2);
        assert_eq!(
            broker
                .queue_stats(tracker.reply_queue())
                .unwrap()
                .total_rejected,
            2
        );
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_with_closed() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(
            Arc::new(broker.transport()),
            &config().with_call_timeout(None),
        )
        .await
        .unwrap();

        let caller = tracker.clone();
        let call = tokio::spawn(async move { caller.call("never", json!({})).await });
        while tracker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        tracker.shutdown().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Closed { .. }));

        let err = tracker.call("after", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_consumer_cancellation_rejects_pending() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(
            Arc::new(broker.transport()),
            &config().with_call_timeout(None),
        )
        .await
        .unwrap();

        let caller = tracker.clone();
        let call = tokio::spawn(async move { caller.call("never", json!({})).await });
        while tracker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        broker.cancel_consumers(tracker.reply_queue());
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Closed { .. }));
        assert!(tracker.is_closed());
    }

    #[tokio::test]
    async fn test_publish_failure_removes_entry() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();
        broker.delete_queue("work");

        let err = tracker.call("echo", json!(1)).await.unwrap_err();
        assert!(matches!(err, RpcError::Publish { .. }));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.get_stats().get_rejected(), 1);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_function_binds_name() {
        let broker = InMemoryBroker::new();
        let tracker = CallTracker::new(Arc::new(broker.transport()), &config())
            .await
            .unwrap();
        let echo = tracker.get_function("echo");
        assert_eq!(echo.name(), "echo");

        let server_side = broker.transport();
        let mut work = server_side.consume("work").await.unwrap();
        let call = tokio::spawn(async move { echo.call(json!("hi")).await });

        let delivery = work.next().await.unwrap();
        let envelope = FunctionCall::decode(&delivery.payload).unwrap();
        assert_eq!(envelope.name, "echo");
        server_side
            .publish(
                tracker.reply_queue(),
                br#""hi""#,
                PublishProperties::reply(delivery.correlation_id.clone()),
            )
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("hi"));
        tracker.shutdown().await.unwrap();
    }
}
