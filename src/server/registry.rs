//! # Handler Registry
//!
//! Name → handler table owned by one dispatcher.
//!
//! Handlers receive the call's `data` and return `Some(reply)` or `None` for
//! fire-and-forget functions. Any error from the handler becomes a
//! `HandlerFailed` dispatch error and the message is rejected.
//!
//! ```rust
//! use queue_rpc::server::{handler_fn, HandlerRegistry};
//!
//! let registry = HandlerRegistry::new();
//! registry.set("echo", handler_fn(|data| async move { Ok(Some(data)) }));
//! assert!(registry.contains("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{from_structured, to_structured, StructuredValue};

/// Future returned by a handler
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Option<StructuredValue>>> + Send>>;

/// Handler function type
///
/// Handlers must be:
/// - `Send + Sync` so worker tasks on any thread can invoke them
/// - Return a pinned future for async execution
/// - Return `anyhow::Result` so handler bodies can use `?` freely
pub type Handler = Arc<dyn Fn(StructuredValue) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(StructuredValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<StructuredValue>>> + Send + 'static,
{
    Arc::new(move |data| -> HandlerFuture { Box::pin(f(data)) })
}

/// Wrap a typed async closure as a [`Handler`]
///
/// The call data is deserialized into `Req` before the closure runs, and the
/// `Resp` it returns is always sent back as the reply.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> Handler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |data| -> HandlerFuture {
        let f = f.clone();
        Box::pin(async move {
            let request: Req = from_structured(data)?;
            let response = f(request).await?;
            Ok(Some(to_structured(&response)?))
        })
    })
}

/// Thread-safe handler table
///
/// Cloning shares the table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `name`, returning the previous one
    pub fn set(&self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.write().insert(name.into(), handler)
    }

    /// Handler registered for `name`
    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
