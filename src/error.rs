//! # RPC Error Types
//!
//! Structured error handling for the RPC layer using thiserror.
//!
//! The taxonomy follows the protocol's failure points: decoding a payload,
//! encoding outbound data, dispatching to a handler, publishing a message,
//! and the transport underneath. Lifecycle errors (`AlreadyStarted`,
//! `Closed`) and call deadlines (`Timeout`) complete the set.

use thiserror::Error;

/// Dispatch failures on the server side
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("No handler registered for '{name}'")]
    HandlerNotFound { name: String },

    #[error("Handler '{name}' failed: {message}")]
    HandlerFailed { name: String, message: String },
}

/// Comprehensive RPC error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Publish to '{destination}' failed: {message}")]
    Publish {
        destination: String,
        message: String,
    },

    #[error("Transport error: {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("Call '{name}' timed out after {timeout_ms}ms (correlation_id: {correlation_id})")]
    Timeout {
        name: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("{component} already started")]
    AlreadyStarted { component: String },

    #[error("{component} is closed")]
    Closed { component: String },

    #[error("Configuration error: {field}: {message}")]
    Configuration { field: String, message: String },
}

impl RpcError {
    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a handler-not-found dispatch error
    pub fn handler_not_found(name: impl Into<String>) -> Self {
        Self::Dispatch(DispatchError::HandlerNotFound { name: name.into() })
    }

    /// Create a handler-failed dispatch error
    pub fn handler_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch(DispatchError::HandlerFailed {
            name: name.into(),
            message: message.into(),
        })
    }

    /// Create a publish error
    pub fn publish(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            destination: destination.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(
        name: impl Into<String>,
        correlation_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self::Timeout {
            name: name.into(),
            correlation_id: correlation_id.into(),
            timeout_ms,
        }
    }

    /// Create an already-started lifecycle error
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Create a closed lifecycle error
    pub fn closed(component: impl Into<String>) -> Self {
        Self::Closed {
            component: component.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Short error class used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Encode { .. } => "encode",
            Self::Dispatch(DispatchError::HandlerNotFound { .. }) => "handler_not_found",
            Self::Dispatch(DispatchError::HandlerFailed { .. }) => "handler_failed",
            Self::Publish { .. } => "publish",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::AlreadyStarted { .. } => "already_started",
            Self::Closed { .. } => "closed",
            Self::Configuration { .. } => "configuration",
        }
    }
}

impl From<config::ConfigError> for RpcError {
    fn from(err: config::ConfigError) -> Self {
        RpcError::configuration("config", err.to_string())
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
