//! In-process server/client pair wired through one in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use queue_rpc::client::CallTracker;
use queue_rpc::config::{RpcConfig, RpcOptions};
use queue_rpc::messaging::{InMemoryBroker, QueueStats};
use queue_rpc::server::{Dispatcher, Handler};

pub const TEST_QUEUE: &str = "rpc_queue";

/// Config for tests: short deadlines, fast sweeps, full protocol trace
pub fn test_config() -> RpcConfig {
    let mut config = RpcConfig::new("memory", TEST_QUEUE)
        .with_options(RpcOptions::verbose())
        .with_call_timeout(Some(Duration::from_millis(500)));
    config.sweep_interval_ms = 20;
    config
}

pub struct RpcHarness {
    pub broker: InMemoryBroker,
    pub server: Dispatcher,
    pub client: CallTracker,
    pub config: RpcConfig,
}

impl RpcHarness {
    /// Start a dispatcher with `handlers` and a client on the same broker
    pub async fn start(config: RpcConfig, handlers: Vec<(&str, Handler)>) -> Self {
        Self::start_on(InMemoryBroker::new(), config, handlers).await
    }

    /// Same as [`RpcHarness::start`] on a broker the caller already holds
    pub async fn start_on(
        broker: InMemoryBroker,
        config: RpcConfig,
        handlers: Vec<(&str, Handler)>,
    ) -> Self {
        let server = Dispatcher::new(Arc::new(broker.transport()), &config)
            .expect("valid dispatcher config");
        for (name, handler) in handlers {
            server.set_handler(name, handler).expect("set handler");
        }
        server.start().await.expect("start dispatcher");

        let client = CallTracker::new(Arc::new(broker.transport()), &config)
            .await
            .expect("start call tracker");

        Self {
            broker,
            server,
            client,
            config,
        }
    }

    pub fn work_queue_stats(&self) -> QueueStats {
        self.broker
            .queue_stats(&self.config.queue_name)
            .expect("work queue declared")
    }

    pub async fn stop(self) {
        self.client.shutdown().await.expect("client shutdown");
        self.server.shutdown().await.expect("server shutdown");
    }
}

/// Poll `condition` until it holds or roughly a second passes
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
