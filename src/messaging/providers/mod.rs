//! # Transport Providers
//!
//! Concrete implementations of the [`Transport`](super::Transport) trait.
//!
//! ## Providers
//!
//! - [`RabbitMqTransport`] - RabbitMQ via the lapin crate
//! - [`InMemoryTransport`] - In-process broker for tests and embedded use

mod in_memory;
mod rabbitmq;

pub use in_memory::{InMemoryBroker, InMemoryTransport};
pub use rabbitmq::RabbitMqTransport;
