//! # Structured Logging Module
//!
//! Environment-aware structured logging setup plus the protocol-trace gate that
//! backs the `log_messages` / `log_errors` options.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::RpcOptions;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// `RUST_LOG` wins over the environment default. Set `RPC_LOG_FORMAT=json` for
/// JSON lines instead of the human-readable console format.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| get_log_level(&environment));
        let json = std::env::var("RPC_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let console = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .json()
                .with_filter(EnvFilter::new(filter))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(filter))
                .boxed()
        };

        // A global subscriber may already be installed by the host application
        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            started_at = %Utc::now().to_rfc3339(),
            "STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("RPC_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Protocol trace gate
///
/// Copied into every dispatcher and tracker. Protocol steps go out at `info`
/// only when `log_messages` is set; failures go out at `error` only when
/// `log_errors` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcLogger {
    component: &'static str,
    options: RpcOptions,
}

impl RpcLogger {
    pub fn new(component: &'static str, options: RpcOptions) -> Self {
        Self { component, options }
    }

    pub fn options(&self) -> RpcOptions {
        self.options
    }

    /// Informational protocol step
    pub fn message(&self, step: &str, detail: &str) {
        if self.options.log_messages {
            tracing::info!(component = self.component, step = %step, "{}", detail);
        }
    }

    /// Error diagnostic with the offending payload attached
    pub fn error(&self, operation: &str, error: &dyn std::fmt::Display, payload: Option<&str>) {
        if self.options.log_errors {
            tracing::error!(
                component = self.component,
                operation = %operation,
                error = %error,
                payload = payload,
                "RPC_ERROR"
            );
        }
    }
}
