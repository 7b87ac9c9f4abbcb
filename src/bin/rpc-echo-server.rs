//! # RPC Echo Server
//!
//! Thin wrapper binary exposing `echo` and `ping` on the configured queue.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration (localhost:5672, rpc_queue)
//! cargo run --bin rpc-echo-server
//!
//! # Override through the environment
//! RPC__ADDRESS=rabbit:5672 RPC__OPTIONS__LOG_MESSAGES=true cargo run --bin rpc-echo-server
//! ```

use chrono::Utc;
use serde_json::json;
use tokio::signal;
use tracing::{error, info};

use queue_rpc::config::RpcConfig;
use queue_rpc::logging;
use queue_rpc::server::{create_rpc_server, handler_fn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging first
    logging::init_structured_logging();

    info!("🚀 Starting RPC Echo Server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RpcConfig::load()?;
    info!("   Queue: {}", config.queue_name);
    info!("   Prefetch: {}", config.prefetch_count);

    let server = create_rpc_server(&config)
        .await
        .map_err(|e| format!("Failed to connect RPC server: {e}"))?;

    server.set_handler("echo", handler_fn(|data| async move { Ok(Some(data)) }))?;
    server.set_handler(
        "ping",
        handler_fn(|_| async move {
            Ok(Some(json!({
                "pong": true,
                "at": Utc::now().to_rfc3339(),
            })))
        }),
    )?;
    server.start().await?;

    info!("🎉 RPC Echo Server started successfully!");
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    if let Err(e) = server.shutdown().await {
        error!("Failed to stop dispatcher cleanly: {}", e);
    } else {
        info!("✅ Dispatcher stopped");
    }

    let stats = server.get_stats();
    info!(
        received = stats.get_received(),
        acked = stats.get_acked(),
        rejected = stats.get_rejected(),
        "👋 RPC Echo Server shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
