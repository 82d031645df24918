//! # Error Types
//!
//! Error types for the request-path engine. `ProxyError` covers everything a
//! proxied request can fail with; `UpstreamError` preserves the raw status
//! and body of an upstream rejection so callers can forward it verbatim.
//!
//! Retry policy lives here as well: [`is_retryable_status`] is the single
//! source of truth for which upstream status codes justify trying the next
//! endpoint.

use thiserror::Error;

/// An HTTP-level rejection from an upstream provider.
///
/// The body is kept as raw text so the gateway can pass a provider's error
/// payload back to the client unchanged.
#[derive(Error, Debug, Clone)]
#[error("upstream returned {status}")]
pub struct UpstreamError {
    /// HTTP status code returned by the upstream
    pub status: u16,
    /// Raw response body, usually a provider error payload
    pub body: String,
}

/// Errors produced by the request-path engine.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Upstream rejected the request with an HTTP error status
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Every candidate endpoint was tried and failed
    #[error("all endpoints failed for model {model}")]
    AllEndpointsFailed {
        model: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// Network-level failure talking to an upstream
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The requested model exists but has no healthy endpoint
    #[error("no healthy endpoint for model {model}")]
    NoHealthyEndpoint { model: String },

    /// The requested model is not configured or is disabled
    #[error("model {model} is not configured or disabled")]
    UnknownModel { model: String },

    /// Upstream returned a body the engine could not parse
    #[error("invalid upstream response: {message}")]
    InvalidResponse { message: String },

    /// The inbound request was canceled before completion
    #[error("request canceled")]
    Canceled,

    /// Durable store failure surfaced to the request path
    #[error("store error: {message}")]
    Store { message: String },

    /// Engine misconfiguration (bad client construction, missing settings)
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ProxyError {
    /// The upstream error carried by this error, if any.
    ///
    /// Walks through the `AllEndpointsFailed` wrapper so callers can recover
    /// the last upstream status after retries are exhausted.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            ProxyError::Upstream(e) => Some(e),
            ProxyError::AllEndpointsFailed { source, .. } => source.upstream(),
            _ => None,
        }
    }

    /// True when this is a cancellation, either explicit or via the HTTP client.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ProxyError::Canceled)
    }
}

/// Whether an upstream status code should trigger selection of the next
/// endpoint instead of failing the client request.
///
/// 401/402/403 are retryable on purpose: with several providers behind one
/// model, a 4xx usually means this provider's key or quota is bad, not that
/// the request itself is.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 401 | 402 | 403 | 408 | 429) || status >= 500
}
