//! # Messaging Module
//!
//! Broker abstraction underneath the RPC protocol.
//!
//! ## Architecture
//!
//! ```text
//! Arc<dyn Transport>
//!   ├── RabbitMqTransport    <- AMQP 0.9.1 via lapin
//!   └── InMemoryTransport    <- channel on an InMemoryBroker
//! ```
//!
//! The dispatcher and the call tracker only see the trait, so either side can
//! run against a real broker or an in-process one.

pub mod providers;
mod transport;
mod types;

pub use providers::{InMemoryBroker, InMemoryTransport, RabbitMqTransport};
pub use transport::{DeliveryStream, Transport};
pub use types::{Delivery, PublishProperties, QueueOptions, QueueStats, ReceiptHandle};
