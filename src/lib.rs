#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Queue RPC
//!
//! Request/response remote procedure calls over an AMQP message queue.
//!
//! ## Overview
//!
//! A client invokes a named function on a server by publishing
//! `{"name": ..., "data": ...}` to a shared work queue and awaiting a reply on
//! its own private queue. The two sides never connect to each other; the
//! correlation token carried as a message property ties each reply back to
//! its call.
//!
//! ## Architecture
//!
//! ```text
//! CallTracker::call(name, data)
//!   └─ publish {name, data} (reply_to, correlation_id) ─▶ shared queue
//!                                                           │
//!                                    Dispatcher ◀───────────┘
//!                                      └─ HandlerRegistry::lookup(name)
//!                                           └─ handler(data) ─▶ reply_to
//!                                                                 │
//! CallTracker reply loop ◀────────────────────────────────────────┘
//!   └─ resolve the pending call with the same correlation_id
//! ```
//!
//! ## Key Features
//!
//! - **Bounded Concurrency**: prefetch limit (default one) sizes the dispatcher's worker pool
//! - **Exactly-once Completion**: every delivery is acked or rejected without requeue, once
//! - **Call Deadlines**: pending calls time out instead of waiting forever
//! - **Pluggable Transport**: RabbitMQ via lapin, or an in-process broker for tests
//!
//! ## Module Organization
//!
//! - [`server`] - Dispatcher and handler registry
//! - [`client`] - Call tracker and bound remote functions
//! - [`messaging`] - Transport trait and providers
//! - [`protocol`] - Wire envelope and correlation tokens
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging and the protocol trace
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use queue_rpc::client::CallTracker;
//! use queue_rpc::config::RpcConfig;
//! use queue_rpc::messaging::InMemoryBroker;
//! use queue_rpc::server::{handler_fn, Dispatcher};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> queue_rpc::Result<()> {
//! let broker = InMemoryBroker::new();
//! let config = RpcConfig::new("memory", "rpc_queue");
//!
//! let server = Dispatcher::new(Arc::new(broker.transport()), &config)?;
//! server.set_handler("echo", handler_fn(|data| async move { Ok(Some(data)) }))?;
//! server.start().await?;
//!
//! let client = CallTracker::new(Arc::new(broker.transport()), &config).await?;
//! let reply = client.call("echo", json!({"x": 1})).await?;
//! assert_eq!(reply, json!({"x": 1}));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod server;

pub use client::{create_rpc_client, CallTracker, RemoteFunction, TrackerStats};
pub use config::{RpcConfig, RpcOptions};
pub use error::{DispatchError, Result, RpcError};
pub use logging::init_structured_logging;
pub use messaging::{InMemoryBroker, InMemoryTransport, RabbitMqTransport, Transport};
pub use protocol::{CorrelationId, FunctionCall, StructuredValue};
pub use server::{
    create_rpc_server, handler_fn, typed_handler, Dispatcher, DispatcherStats, Handler,
    HandlerRegistry,
};
