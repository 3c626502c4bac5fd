//! Job handlers and the worker dispatcher.
//!
//! Every queue fleetd serves is bound to one [`JobHandler`] in a
//! [`JobRegistry`] built at startup. The [`WorkerDispatcher`] runs a pool of
//! consumers per queue; a handler reports failure through a single channel,
//! `Result<(), HandlerError>`, and a panic inside a handler is converted to
//! [`HandlerError::Panicked`] at the dispatcher boundary.

mod dispatcher;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::{EventError, RawEnvelope};
use thiserror::Error;

use crate::db::StoreError;
use crate::provider::ProviderError;

pub use dispatcher::{Consumer, WorkerDispatcher, DEFAULT_POLL_TIMEOUT};

/// Job handler errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The envelope or its argument could not be decoded.
    #[error("failed to decode job: {0}")]
    Decode(#[from] EventError),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A provider call failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Any other failure.
    #[error("{0}")]
    Fatal(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Handles jobs popped from one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError>;
}

/// Queue name to handler.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `queue`, replacing any previous binding.
    pub fn register(&mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(queue, handler);
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Queues with a handler.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
