//! # In-Memory Transport
//!
//! Thread-safe in-process broker for tests and single-process deployments.
//!
//! ## Features
//!
//! - **Prefetch Enforcement**: a consumer never holds more unacked deliveries than its limit
//! - **Competing Consumers**: round-robin delivery across consumers of one queue
//! - **Private Queues**: server-named, exclusive to the declaring channel
//! - **Disposition Tracking**: per-queue ack/reject counters for assertions
//!
//! One [`InMemoryBroker`] plays the broker; each [`InMemoryTransport`] opened
//! from it plays a channel, so a server and a client can share the same queues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::messaging::transport::{DeliveryStream, Transport};
use crate::messaging::types::{
    Delivery, PublishProperties, QueueOptions, QueueStats, ReceiptHandle,
};

/// Message stored in a queue
#[derive(Debug, Clone)]
struct StoredMessage {
    /// Broker-wide sequence, doubles as the delivery tag
    seq: u64,
    payload: Vec<u8>,
    properties: PublishProperties,
    redelivered: bool,
}

/// One active consumer of a queue
#[derive(Debug)]
struct ConsumerSlot {
    id: u64,
    /// Prefetch limit captured at consume time; 0 means unlimited
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    options: QueueOptions,
    /// Declaring channel for exclusive queues
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    /// seq -> (consumer id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    total_published: u64,
    total_delivered: u64,
    total_acked: u64,
    total_rejected: u64,
}

impl InMemoryQueue {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            options,
            owner,
            ..Self::default()
        }
    }

    fn stats(&self, queue_name: &str) -> QueueStats {
        QueueStats {
            queue_name: queue_name.to_string(),
            ready_count: self.ready.len() as u64,
            unacked_count: self.unacked.len() as u64,
            total_published: self.total_published,
            total_delivered: self.total_delivered,
            total_acked: self.total_acked,
            total_rejected: self.total_rejected,
        }
    }

    /// Hand ready messages to consumers that have prefetch capacity
    fn pump(&mut self, queue_name: &str) {
        while let Some(idx) = self.consumers.iter().position(|c| c.sender.is_closed()) {
            self.drop_consumer(idx);
        }

        loop {
            if self.ready.is_empty() || self.consumers.is_empty() {
                return;
            }

            let count = self.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (self.next_consumer + offset) % count)
                .find(|&idx| self.consumers[idx].has_capacity())
            else {
                return;
            };
            self.next_consumer = (idx + 1) % count;

            let Some(message) = self.ready.pop_front() else {
                return;
            };

            let delivery = Delivery {
                receipt_handle: ReceiptHandle::from(message.seq),
                queue_name: queue_name.to_string(),
                payload: message.payload.clone(),
                correlation_id: message.properties.correlation_id.clone(),
                reply_to: message.properties.reply_to.clone(),
                redelivered: message.redelivered,
            };

            if self.consumers[idx].sender.send(delivery).is_err() {
                // Receiver dropped: the consumer is gone
                self.ready.push_front(message);
                self.drop_consumer(idx);
                continue;
            }

            let consumer = &mut self.consumers[idx];
            consumer.in_flight += 1;
            let consumer_id = consumer.id;
            self.unacked.insert(message.seq, (consumer_id, message));
            self.total_delivered += 1;
        }
    }

    /// Remove a consumer and return its unacked messages to the head of the queue
    fn drop_consumer(&mut self, idx: usize) {
        let consumer = self.consumers.remove(idx);
        self.next_consumer = 0;

        let mut orphaned: Vec<StoredMessage> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer.id)
            .map(|(_, (_, msg))| msg.clone())
            .collect();
        orphaned.sort_by_key(|m| m.seq);

        for mut msg in orphaned.into_iter().rev() {
            self.unacked.remove(&msg.seq);
            msg.redelivered = true;
            self.ready.push_front(msg);
        }
    }

    /// Settle an unacked delivery, returning the message and freeing consumer capacity
    fn settle(&mut self, seq: u64) -> Option<StoredMessage> {
        let (consumer_id, message) = self.unacked.remove(&seq)?;
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(message)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, InMemoryQueue>,
    next_seq: u64,
    next_consumer_id: u64,
    next_channel_id: u64,
}

/// In-process broker shared by any number of transports
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel on this broker
    pub fn transport(&self) -> InMemoryTransport {
        let channel_id = {
            let mut state = self.state.lock();
            state.next_channel_id += 1;
            state.next_channel_id
        };
        InMemoryTransport {
            broker: self.clone(),
            channel_id,
            prefetch: AtomicU16::new(0),
        }
    }

    /// Get statistics for a queue (for testing)
    pub fn queue_stats(&self, queue_name: &str) -> Option<QueueStats> {
        let state = self.state.lock();
        state.queues.get(queue_name).map(|q| q.stats(queue_name))
    }

    /// Number of ready messages in a queue (for testing)
    pub fn queue_length(&self, queue_name: &str) -> usize {
        let state = self.state.lock();
        state
            .queues
            .get(queue_name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Whether a queue exists
    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.state.lock().queues.contains_key(queue_name)
    }

    /// Delete a queue with its messages; its consumers' streams end
    pub fn delete_queue(&self, queue_name: &str) -> bool {
        self.state.lock().queues.remove(queue_name).is_some()
    }

    /// Cancel every consumer of a queue; their delivery streams end
    ///
    /// Unacked messages return to the queue. An auto-delete queue is removed.
    pub fn cancel_consumers(&self, queue_name: &str) {
        let mut state = self.state.lock();
        let auto_delete = match state.queues.get_mut(queue_name) {
            Some(queue) => {
                while !queue.consumers.is_empty() {
                    queue.drop_consumer(0);
                }
                queue.options.auto_delete
            }
            None => return,
        };
        if auto_delete {
            state.queues.remove(queue_name);
        }
    }
}

/// Channel on an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    channel_id: u64,
    prefetch: AtomicU16,
}

impl InMemoryTransport {
    /// Channel on a fresh private broker
    pub fn new() -> Self {
        InMemoryBroker::new().transport()
    }

    /// Broker this channel belongs to
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn settle(&self, delivery: &Delivery, operation: &str) -> Result<(String, StoredMessage)> {
        let seq = delivery.receipt_handle.as_u64().ok_or_else(|| {
            RpcError::transport(
                operation,
                format!("invalid receipt handle: {}", delivery.receipt_handle),
            )
        })?;

        let mut state = self.broker.state.lock();
        let queue = state.queues.get_mut(&delivery.queue_name).ok_or_else(|| {
            RpcError::transport(operation, format!("no such queue: {}", delivery.queue_name))
        })?;
        let message = queue.settle(seq).ok_or_else(|| {
            RpcError::transport(operation, format!("unknown delivery tag: {seq}"))
        })?;
        Ok((delivery.queue_name.clone(), message))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue_name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut state = self.broker.state.lock();
        if let Some(existing) = state.queues.get(&queue_name) {
            if existing.options.exclusive && existing.owner != Some(self.channel_id) {
                return Err(RpcError::transport(
                    "declare_queue",
                    format!("queue '{queue_name}' is exclusive to another channel"),
                ));
            }
            return Ok(queue_name);
        }

        let owner = options.exclusive.then_some(self.channel_id);
        state
            .queues
            .insert(queue_name.clone(), InMemoryQueue::new(options, owner));
        Ok(queue_name)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let prefetch = self.prefetch.load(Ordering::SeqCst);

        {
            let mut state = self.broker.state.lock();
            state.next_consumer_id += 1;
            let id = state.next_consumer_id;

            let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
                RpcError::transport("consume", format!("no such queue: {queue_name}"))
            })?;
            if queue.options.exclusive && queue.owner != Some(self.channel_id) {
                return Err(RpcError::transport(
                    "consume",
                    format!("queue '{queue_name}' is exclusive to another channel"),
                ));
            }

            queue.consumers.push(ConsumerSlot {
                id,
                prefetch,
                in_flight: 0,
                sender,
            });
            queue.pump(queue_name);
        }

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            receiver.poll_recv(cx)
        })))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (queue_name, _) = self.settle(delivery, "ack")?;
        let mut state = self.broker.state.lock();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.total_acked += 1;
            queue.pump(&queue_name);
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let (queue_name, mut message) = self.settle(delivery, "reject")?;
        let mut state = self.broker.state.lock();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.total_rejected += 1;
            if requeue {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            queue.pump(&queue_name);
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue_name: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| RpcError::publish(queue_name, "no such queue"))?;

        queue.ready.push_back(StoredMessage {
            seq,
            payload: payload.to_vec(),
            properties,
            redelivered: false,
        });
        queue.total_published += 1;
        queue.pump(queue_name);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
