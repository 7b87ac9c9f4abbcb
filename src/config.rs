//! # RPC Configuration
//!
//! Layered configuration for servers and clients, loaded with the `config` crate:
//!
//! 1. Built-in defaults ([`RpcConfig::default`])
//! 2. An optional TOML/YAML/JSON file (`config/rpc.*` or an explicit path)
//! 3. Environment variables prefixed with `RPC__` (`RPC__QUEUE_NAME`,
//!    `RPC__OPTIONS__LOG_ERRORS`, ...)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queue_rpc::config::RpcConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RpcConfig::load()?;
//! println!("broker: {}", config.amqp_url());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RpcError};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "RPC";

/// Default configuration file stem, resolved relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/rpc";

/// Protocol logging flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcOptions {
    /// Emit an informational trace of protocol steps
    pub log_messages: bool,
    /// Emit error diagnostics on decode/dispatch/reply failures
    pub log_errors: bool,
}

impl RpcOptions {
    /// Both traces enabled
    pub fn verbose() -> Self {
        Self {
            log_messages: true,
            log_errors: true,
        }
    }
}

/// Root configuration for an RPC server or client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Broker address, either `host:port` or a full `amqp://` URL
    pub address: String,
    /// Shared work queue name
    pub queue_name: String,
    /// Protocol logging flags
    pub options: RpcOptions,
    /// Maximum unacknowledged deliveries per dispatcher; also its worker-pool size
    pub prefetch_count: u16,
    /// Pending-call deadline in milliseconds; `0` leaves calls unbounded
    pub call_timeout_ms: u64,
    /// Period of the pending-call timeout sweeper in milliseconds
    pub sweep_interval_ms: u64,
    /// AMQP connection name shown in the broker's management UI
    pub connection_name: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            address: "localhost:5672".to_string(),
            queue_name: "rpc_queue".to_string(),
            options: RpcOptions::default(),
            prefetch_count: 1,
            call_timeout_ms: 30_000,
            sweep_interval_ms: 250,
            connection_name: "queue-rpc".to_string(),
        }
    }
}

impl RpcConfig {
    /// Configuration for `address` and `queue_name` with every other field defaulted
    pub fn new(address: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Replace the logging flags
    pub fn with_options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the prefetch limit
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Replace the call deadline; `None` disables it
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        self
    }

    /// Load from `config/rpc.*` (if present) and `RPC__*` environment variables
    pub fn load() -> Result<Self> {
        Self::build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load from an explicit file plus `RPC__*` environment variables
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RpcError::configuration(
                "path",
                format!("configuration file not found: {}", path.display()),
            ));
        }
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: RpcConfig = Config::builder()
            .add_source(Config::try_from(&RpcConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        debug!(
            address = %config.address,
            queue_name = %config.queue_name,
            prefetch_count = config.prefetch_count,
            call_timeout_ms = config.call_timeout_ms,
            "RPC configuration loaded"
        );

        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(RpcError::configuration("address", "cannot be empty"));
        }

        if self.queue_name.trim().is_empty() {
            return Err(RpcError::configuration("queue_name", "cannot be empty"));
        }

        if self.prefetch_count < 1 {
            return Err(RpcError::configuration(
                "prefetch_count",
                "must be at least 1",
            ));
        }

        if self.sweep_interval_ms < 1 {
            return Err(RpcError::configuration(
                "sweep_interval_ms",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Broker URL; a bare `host:port` gets the `amqp://` scheme
    pub fn amqp_url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("amqp://{}", self.address)
        }
    }

    /// Pending-call deadline, `None` when unbounded
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    /// Timeout sweeper period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
