//! # Transport Trait
//!
//! The boundary between the RPC protocol and the message broker. A transport
//! is one open channel: it declares queues, consumes with explicit
//! acknowledgement, and publishes payloads with correlation properties.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::types::{Delivery, PublishProperties, QueueOptions};
use crate::error::Result;

/// Stream of deliveries from one consumer; ends when the consumer is cancelled
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Broker channel operations required by the dispatcher and the call tracker
///
/// Implementations must make every delivery end in exactly one of `ack` or
/// `reject`; a second disposition for the same receipt is an error.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declare a queue and return its name
    ///
    /// An empty `name` asks the broker to generate one, which is how private
    /// reply queues are created.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Limit unacknowledged deliveries per consumer started after this call
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement
    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream>;

    /// Remove a delivered message permanently as processed
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Remove (or with `requeue`, return) a delivered message as failed
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Publish a payload to a queue through the default exchange
    async fn publish(
        &self,
        queue_name: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()>;

    /// Close the underlying channel; the default does nothing
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}
