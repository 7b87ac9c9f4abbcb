//! # RPC Client
//!
//! Correlated calls over a shared work queue with replies on a private queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queue_rpc::config::RpcConfig;
//! use queue_rpc::client::create_rpc_client;
//! use serde_json::json;
//!
//! # async fn example() -> queue_rpc::Result<()> {
//! let client = create_rpc_client(&RpcConfig::new("localhost:5672", "rpc_queue")).await?;
//! let echo = client.get_function("echo");
//! let reply = echo.call(json!({"x": 1})).await?;
//! assert_eq!(reply, json!({"x": 1}));
//! # Ok(())
//! # }
//! ```

mod pending;
mod tracker;

use std::sync::Arc;

use tracing::info;

pub use tracker::{CallTracker, RemoteFunction, TrackerStats};

use crate::config::RpcConfig;
use crate::error::Result;
use crate::messaging::RabbitMqTransport;

/// Connect to RabbitMQ, declare a private reply queue and start a [`CallTracker`]
pub async fn create_rpc_client(config: &RpcConfig) -> Result<CallTracker> {
    config.validate()?;

    let transport = RabbitMqTransport::from_config(config).await?;
    let tracker = CallTracker::new(Arc::new(transport), config).await?;

    info!(
        connection_name = %config.connection_name,
        queue = %config.queue_name,
        reply_queue = %tracker.reply_queue(),
        "RPC client connected"
    );

    Ok(tracker)
}
