//! Model gateway: the boundary between the engine and LLM backends.
//!
//! The engine treats model ids as opaque; a [`ModelGateway`] takes a
//! normalized request and returns either text or a typed error. Vendor
//! dialects live behind the trait. When a backend reports a separate
//! reasoning field, the gateway prepends it to the content inside a
//! `<think>…</think>` sentinel block; stripping it back out is the
//! prompt builder's job.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::{ModelEntry, ModelKind},
    prelude::*,
};

pub mod echo;
pub mod http;

/// A normalized generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// 0 means unset.
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

/// Errors a gateway can return, tagged by how the caller should react.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Worth retrying: HTTP 408/429/5xx, connection resets, timeouts.
    #[error("transient model error{}: {message}", fmt_status(*status))]
    Transient {
        status: Option<u16>,
        /// Server-supplied `Retry-After` hint, when present.
        retry_after: Option<Duration>,
        message: String,
    },

    /// A 4xx other than 408/429. Fatal for the job.
    #[error("model rejected request (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    /// Non-JSON or unexpected response shape. Fatal for the job.
    #[error("malformed model response: {0}")]
    Malformed(String),

    /// The surrounding scope was cancelled. Not an error for counters.
    #[error("request cancelled")]
    Cancelled,
}

fn fmt_status(status: Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl ModelError {
    /// Should the retry policy consider another attempt?
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient { .. })
    }

    /// The server's `Retry-After` hint, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Interface to a model backend.
#[async_trait]
pub trait ModelGateway: std::fmt::Debug + Send + Sync + 'static {
    /// Run one generation request to completion.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ModelError>;
}

/// Instantiate the gateway for a registry entry.
pub fn create_gateway(id: &str, entry: &ModelEntry) -> Result<Arc<dyn ModelGateway>> {
    match entry.kind {
        ModelKind::Echo => Ok(Arc::new(echo::EchoGateway::new())),
        ModelKind::Chat | ModelKind::Completion => {
            Ok(Arc::new(http::HttpGateway::new(id, entry)?))
        }
    }
}

/// A gateway backed by a closure, for unit tests.
#[cfg(test)]
pub(crate) struct FnGateway<F>(pub F);

#[cfg(test)]
impl<F> std::fmt::Debug for FnGateway<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnGateway")
    }
}

#[cfg(test)]
#[async_trait]
impl<F> ModelGateway for FnGateway<F>
where
    F: Fn(&GenerationRequest) -> Result<String, ModelError> + Send + Sync + 'static,
{
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ModelError> {
        (self.0)(request)
    }
}
