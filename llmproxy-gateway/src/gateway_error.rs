//! # Gateway Errors
//!
//! HTTP-facing error type. Every failure leaves the gateway as an
//! Anthropic-style envelope:
//!
//! ```json
//! {"type": "error", "error": {"type": "...", "message": "..."}, "detail": "..."}
//! ```
//!
//! Upstream rejections keep their original status; a non-retryable 4xx body
//! from a provider is passed through verbatim when it is already valid JSON.
//! Retry-exhausted failures propagate 403/429 from the last upstream error
//! and collapse everything else to 502.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use llmproxy_core::ProxyError;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Client authentication failures
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Malformed or unroutable client requests
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Request-path engine failures, including upstream errors
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// JSON handling failures
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Everything else
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::Auth { message } => {
                envelope(StatusCode::UNAUTHORIZED, "authentication_error", message)
            }
            GatewayError::InvalidRequest { message } => {
                envelope(StatusCode::BAD_REQUEST, "invalid_request_error", message)
            }
            GatewayError::Proxy(e) => proxy_response(e),
            GatewayError::Serialization(e) => envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                &e.to_string(),
            ),
            GatewayError::Internal { message } => {
                envelope(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
            }
        }
    }
}

fn proxy_response(error: &ProxyError) -> Response {
    match error {
        ProxyError::Upstream(upstream) => {
            let status = StatusCode::from_u16(upstream.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            // A provider error body is usually already the Anthropic error
            // shape; forward it untouched when it parses.
            if serde_json::from_str::<serde_json::Value>(&upstream.body).is_ok() {
                return Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from(upstream.body.clone()))
                    .unwrap_or_else(|_| status.into_response());
            }
            envelope(status, "upstream_error", &upstream.body)
        }
        ProxyError::AllEndpointsFailed { model, source } => {
            let status = match source.upstream().map(|u| u.status) {
                Some(403) => StatusCode::FORBIDDEN,
                Some(429) => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            };
            envelope(
                status,
                "upstream_error",
                &format!("all endpoints failed for model {model}: {source}"),
            )
        }
        ProxyError::UnknownModel { model } => envelope(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &format!("model {model} does not exist or is disabled"),
        ),
        ProxyError::NoHealthyEndpoint { model } => envelope(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            &format!("no healthy endpoint available for {model}"),
        ),
        ProxyError::Canceled => envelope(
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "request_canceled",
            "request canceled by client",
        ),
        other => envelope(StatusCode::BAD_GATEWAY, "api_error", &other.to_string()),
    }
}

fn envelope(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = Json(json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        },
        "detail": message,
    }));
    (status, body).into_response()
}
