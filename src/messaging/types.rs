//! # Messaging Types
//!
//! Transport-level envelope types shared by every provider.

/// Handle for acknowledging/rejecting a received message
///
/// The format is provider-specific:
/// - RabbitMQ: delivery tag as string
/// - InMemory: internal sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Create a new receipt handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Try to parse the receipt handle as a u64 (delivery tag / sequence)
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReceiptHandle {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

/// A message delivered by a consumer
///
/// Never mutated by the RPC layer; replies are published as new messages.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Handle for ack/reject
    pub receipt_handle: ReceiptHandle,
    /// Queue the message was consumed from
    pub queue_name: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Correlation token property
    pub correlation_id: Option<String>,
    /// Reply destination property
    pub reply_to: Option<String>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

impl Delivery {
    /// Payload as text for diagnostics
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Message properties set on publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl PublishProperties {
    /// Properties for an outbound call
    pub fn call(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Properties for a reply; the correlation token is echoed as received
    pub fn reply(correlation_id: Option<String>) -> Self {
        Self {
            reply_to: None,
            correlation_id,
        }
    }
}

/// Queue declaration flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Shared work queue consumed competitively by servers
    ///
    /// Durable, matching the broker-side declaration of other clients of
    /// the same queue; redeclaring with different flags fails.
    pub fn shared() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue owned by one client
    pub fn private_reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Queue statistics for monitoring and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_name: String,
    /// Messages waiting for a consumer
    pub ready_count: u64,
    /// Messages delivered but not yet acked or rejected
    pub unacked_count: u64,
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_acked: u64,
    pub total_rejected: u64,
}
