//! # RPC Server
//!
//! Named-handler dispatch over a shared work queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queue_rpc::config::RpcConfig;
//! use queue_rpc::server::{create_rpc_server, handler_fn};
//!
//! # async fn example() -> queue_rpc::Result<()> {
//! let server = create_rpc_server(&RpcConfig::new("localhost:5672", "rpc_queue")).await?;
//! server.set_handler("echo", handler_fn(|data| async move { Ok(Some(data)) }))?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod registry;

use std::sync::Arc;

use tracing::info;

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use registry::{handler_fn, typed_handler, Handler, HandlerFuture, HandlerRegistry};

use crate::config::RpcConfig;
use crate::error::Result;
use crate::messaging::{QueueOptions, RabbitMqTransport, Transport};

/// Connect to RabbitMQ, declare the shared queue and build a [`Dispatcher`]
///
/// Handlers are registered on the returned dispatcher before calling
/// [`Dispatcher::start`].
pub async fn create_rpc_server(config: &RpcConfig) -> Result<Dispatcher> {
    config.validate()?;

    let transport = RabbitMqTransport::from_config(config).await?;
    transport
        .declare_queue(&config.queue_name, QueueOptions::shared())
        .await?;

    info!(
        connection_name = %config.connection_name,
        queue = %config.queue_name,
        "RPC server connected"
    );

    Dispatcher::new(Arc::new(transport), config)
}
