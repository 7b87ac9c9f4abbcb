//! # Dispatcher
//!
//! Server role of the RPC protocol: consumes the shared work queue, routes
//! each call to its handler by name, publishes the handler's reply to the
//! caller's private queue, and completes every delivery exactly once.
//!
//! ## Architecture
//!
//! - **Worker Pool**: a semaphore sized to the prefetch limit; a permit is
//!   taken before the next delivery is fetched, so with the default limit of
//!   one, handler execution is serialized
//! - **Completion**: ack after the handler (and its reply) succeed; reject
//!   without requeue on any decode, dispatch, or publish failure
//! - **Observability**: atomic counters plus the `log_messages`/`log_errors` trace
//!
//! The consume loop survives every per-message failure.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::logging::RpcLogger;
use crate::messaging::{Delivery, DeliveryStream, PublishProperties, QueueOptions, Transport};
use crate::protocol::{encode_value, FunctionCall};
use crate::server::registry::{Handler, HandlerRegistry};

const COMPONENT: &str = "dispatcher";

/// Statistics for dispatcher observability
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Deliveries taken from the shared queue
    pub received: AtomicU64,
    /// Deliveries acknowledged after successful dispatch
    pub acked: AtomicU64,
    /// Deliveries rejected without requeue
    pub rejected: AtomicU64,
    /// Replies written to reply queues
    pub replies_published: AtomicU64,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn get_acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn get_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn get_replies_published(&self) -> u64 {
        self.replies_published.load(Ordering::Relaxed)
    }
}

/// State shared with the consume loop and its workers
struct DispatchContext {
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    logger: RpcLogger,
    stats: Arc<DispatcherStats>,
}

impl DispatchContext {
    /// Run one delivery to its terminal disposition
    async fn process(&self, delivery: Delivery) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.logger.message(
            "receive",
            &format!("Received message: {}", delivery.payload_text()),
        );

        match self.dispatch(&delivery).await {
            Ok(()) => match self.transport.ack(&delivery).await {
                Ok(()) => {
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                    self.logger.message(
                        "ack",
                        &format!("Acknowledged message {}", delivery.receipt_handle),
                    );
                }
                Err(e) => {
                    warn!(receipt = %delivery.receipt_handle, error = %e, "Failed to ack delivery");
                    self.logger.error("ack", &e, None);
                }
            },
            Err(e) => {
                let payload = delivery.payload_text();
                self.logger.error(e.kind(), &e, Some(payload.as_str()));

                match self.transport.reject(&delivery, false).await {
                    Ok(()) => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(reject_err) => {
                        warn!(
                            receipt = %delivery.receipt_handle,
                            error = %reject_err,
                            "Failed to reject delivery"
                        );
                        self.logger.error("reject", &reject_err, None);
                    }
                }
            }
        }
    }

    /// Decode, route, invoke and reply; any error means the delivery is rejected
    async fn dispatch(&self, delivery: &Delivery) -> Result<()> {
        let FunctionCall { name, data } = FunctionCall::decode(&delivery.payload)?;

        let handler = self
            .registry
            .lookup(&name)
            .ok_or_else(|| RpcError::handler_not_found(&name))?;

        self.logger.message("invoke", &format!("Calling function '{name}'"));

        let result = AssertUnwindSafe(handler(data))
            .catch_unwind()
            .await
            .map_err(|_| RpcError::handler_failed(&name, "handler panicked"))?
            .map_err(|e| RpcError::handler_failed(&name, format!("{e:#}")))?;

        let Some(value) = result else {
            self.logger
                .message("no_reply", &format!("Function '{name}' returned no reply"));
            return Ok(());
        };

        let reply_to = delivery.reply_to.as_deref().ok_or_else(|| {
            RpcError::publish("<missing reply_to>", "delivery has no reply destination")
        })?;
        let payload = encode_value(&value)?;

        self.transport
            .publish(
                reply_to,
                &payload,
                PublishProperties::reply(delivery.correlation_id.clone()),
            )
            .await?;

        self.stats.replies_published.fetch_add(1, Ordering::Relaxed);
        self.logger.message(
            "reply",
            &format!("Replied to {reply_to} with {}", String::from_utf8_lossy(&payload)),
        );
        Ok(())
    }
}

/// RPC server bound to one shared queue
///
/// Dropping the dispatcher stops its consume loop.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    queue_name: String,
    prefetch_count: u16,
    started: AtomicBool,
    /// Serializes handler registration against the transition to started
    lifecycle: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_name", &self.queue_name)
            .field("prefetch_count", &self.prefetch_count)
            .field("provider", &self.ctx.transport.provider_name())
            .field("handlers", &self.ctx.registry)
            .field("started", &self.is_started())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher for `config.queue_name` on an open transport
    pub fn new(transport: Arc<dyn Transport>, config: &RpcConfig) -> Result<Self> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(DispatchContext {
                transport,
                registry: HandlerRegistry::new(),
                logger: RpcLogger::new(COMPONENT, config.options),
                stats: Arc::new(DispatcherStats::new()),
            }),
            queue_name: config.queue_name.clone(),
            prefetch_count: config.prefetch_count,
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// Register or replace the handler for `name`
    ///
    /// Handlers are fixed once the dispatcher starts.
    pub fn set_handler(&self, name: impl Into<String>, handler: Handler) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_started() {
            return Err(RpcError::already_started(COMPONENT));
        }

        let name = name.into();
        debug!(handler = %name, "Registering RPC handler");
        self.ctx.registry.set(name, handler);
        Ok(())
    }

    /// Begin consuming the shared queue
    ///
    /// Declares the queue, applies the prefetch limit and spawns the consume
    /// loop. A second call returns [`RpcError::AlreadyStarted`].
    pub async fn start(&self) -> Result<()> {
        {
            let _lifecycle = self.lifecycle.lock();
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(RpcError::already_started(COMPONENT));
            }
        }

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            queue = %self.queue_name,
            prefetch_count = self.prefetch_count,
            provider = self.ctx.transport.provider_name(),
            handlers = ?self.ctx.registry.names(),
            "Starting RPC dispatcher"
        );
        self.ctx.logger.message(
            "start",
            &format!("Server listening on queue {}", self.queue_name),
        );

        let handle = tokio::spawn(consume_loop(
            self.ctx.clone(),
            stream,
            Arc::new(Semaphore::new(self.prefetch_count as usize)),
            self.prefetch_count as u32,
            self.shutdown_tx.subscribe(),
        ));
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    async fn open_stream(&self) -> Result<DeliveryStream> {
        let transport = &self.ctx.transport;
        transport
            .declare_queue(&self.queue_name, QueueOptions::shared())
            .await?;
        transport.set_prefetch(self.prefetch_count).await?;
        transport.consume(&self.queue_name).await
    }

    /// Stop fetching, wait for in-flight handlers, then close the transport
    pub async fn shutdown(&self) -> Result<()> {
        info!(queue = %self.queue_name, "Stopping RPC dispatcher");
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher consume loop ended abnormally");
            }
        }

        self.ctx.transport.close().await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the consume loop is still running
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Handlers registered on this dispatcher
    pub fn registry(&self) -> &HandlerRegistry {
        &self.ctx.registry
    }

    /// Get dispatcher statistics
    pub fn get_stats(&self) -> Arc<DispatcherStats> {
        self.ctx.stats.clone()
    }
}

/// Fetch deliveries one permit at a time and hand each to a worker task
async fn consume_loop(
    ctx: Arc<DispatchContext>,
    mut stream: DeliveryStream,
    semaphore: Arc<Semaphore>,
    pool_size: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown_rx.changed() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = stream.next() => next,
        };

        let Some(delivery) = next else {
            ctx.logger
                .error("consume", &"consumer cancelled", None);
            warn!("RPC dispatcher consumer cancelled by broker");
            break;
        };

        let worker_ctx = ctx.clone();
        tokio::spawn(async move {
            worker_ctx.process(delivery).await;
            drop(permit);
        });
    }

    // Wait for in-flight workers before reporting the loop as finished
    let _ = semaphore.acquire_many(pool_size).await;
    debug!("RPC dispatcher consume loop exited");
}
