//! # RabbitMQ Transport
//!
//! AMQP 0.9.1 implementation of [`Transport`] using the `lapin` crate.
//!
//! One transport owns one connection and one channel. Queues are declared
//! through the default exchange so the routing key is the queue name, and
//! consumers use manual acknowledgement so the dispatcher and the call
//! tracker decide every disposition.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use queue_rpc::messaging::{RabbitMqTransport, Transport, QueueOptions};
//!
//! let transport = RabbitMqTransport::connect("amqp://localhost:5672", "queue-rpc").await?;
//! transport.declare_queue("rpc_queue", QueueOptions::shared()).await?;
//! ```

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::messaging::transport::{DeliveryStream, Transport};
use crate::messaging::types::{Delivery, PublishProperties, QueueOptions, ReceiptHandle};

/// RabbitMQ-backed transport
#[derive(Debug)]
pub struct RabbitMqTransport {
    /// RabbitMQ connection
    connection: Connection,
    /// Channel for queue operations
    channel: Channel,
}

impl RabbitMqTransport {
    /// Connect to `url` and open a channel
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(connection_name.into()),
        )
        .await
        .map_err(|e| RpcError::transport("connect", format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection.create_channel().await.map_err(|e| {
            RpcError::transport("create_channel", format!("RabbitMQ channel creation failed: {e}"))
        })?;

        debug!(
            connection_name = %connection_name,
            channel_id = channel.id(),
            "RabbitMQ channel opened"
        );

        Ok(Self {
            connection,
            channel,
        })
    }

    /// Connect using the address and connection name from configuration
    pub async fn from_config(config: &RpcConfig) -> Result<Self> {
        Self::connect(&config.amqp_url(), &config.connection_name).await
    }

    fn delivery_tag(delivery: &Delivery) -> Result<u64> {
        delivery.receipt_handle.as_u64().ok_or_else(|| {
            RpcError::transport(
                "receipt",
                format!("invalid receipt handle: {}", delivery.receipt_handle),
            )
        })
    }
}

fn to_delivery(queue_name: &str, delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        receipt_handle: ReceiptHandle::from(delivery.delivery_tag),
        queue_name: queue_name.to_string(),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        redelivered: delivery.redelivered,
        payload: delivery.data,
    }
}

#[async_trait]
impl Transport for RabbitMqTransport {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::transport("queue_declare", format!("{name}: {e}")))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::transport("basic_qos", format!("Failed to set QoS: {e}")))
    }

    async fn consume(&self, queue_name: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::transport("basic_consume", format!("{queue_name}: {e}")))?;

        let queue_name = queue_name.to_string();
        let stream = consumer
            .take_while(|item| {
                if let Err(e) = item {
                    warn!(error = %e, "RabbitMQ consumer failed; ending delivery stream");
                }
                future::ready(item.is_ok())
            })
            .filter_map(move |item| {
                future::ready(item.ok().map(|delivery| to_delivery(&queue_name, delivery)))
            });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let tag = Self::delivery_tag(delivery)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::transport("basic_ack", format!("tag {tag}: {e}")))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let tag = Self::delivery_tag(delivery)?;
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| RpcError::transport("basic_reject", format!("tag {tag}: {e}")))
    }

    async fn publish(
        &self,
        queue_name: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let mut amqp_properties =
            BasicProperties::default().with_content_type("application/json".into());
        if let Some(reply_to) = properties.reply_to {
            amqp_properties = amqp_properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = properties.correlation_id {
            amqp_properties = amqp_properties.with_correlation_id(correlation_id.into());
        }

        let confirm = self
            .channel
            .basic_publish(
                "",         // Default exchange
                queue_name, // Routing key = queue name
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await
            .map_err(|e| RpcError::publish(queue_name, format!("Publish failed: {e}")))?;

        confirm.await.map_err(|e| {
            RpcError::publish(queue_name, format!("Publish confirmation failed: {e}"))
        })?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| RpcError::transport("close", e.to_string()))?;
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}
