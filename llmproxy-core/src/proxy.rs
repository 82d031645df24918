//! # Upstream Proxy
//!
//! Forwards Anthropic messages traffic to the selected endpoint, retrying
//! across endpoints on retryable failures. Two modes share the retry
//! envelope:
//!
//! - **Non-streaming** uses a pooled client with a 120s timeout. Up to
//!   three endpoints are attempted; latency is measured per attempt.
//! - **Streaming** retries only during the connection phase. Once the first
//!   upstream byte is in flight the stream is committed: chunks are
//!   forwarded verbatim through a bounded channel and a terminal chunk
//!   carries the final accounting.
//!
//! Non-retryable client errors (400, 404, 413, 422 and other unlisted 4xx)
//! are returned to the caller with the upstream body untouched. 401, 402,
//! 403, 408, 429 and all 5xx trigger the next endpoint, because in a
//! multi-provider setup those usually indict the provider, not the request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::error::{is_retryable_status, ProxyError, UpstreamError};
use crate::health::{ConnectionGuard, HealthChecker};
use crate::models::{
    compute_cost, Endpoint, MessagesRequest, MessagesResponse, ProxyMetadata, StreamChunk,
};

/// Default `anthropic-version` sent upstream when the client supplied none.
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Capacity of the per-stream chunk channel; the backpressure boundary
/// between a slow client and the upstream read loop.
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

const MAX_ATTEMPTS: usize = 3;
const SYNC_TIMEOUT: Duration = Duration::from_secs(120);
const POOL_MAX_IDLE_PER_HOST: usize = 20;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub struct UpstreamProxy {
    sync_client: reqwest::Client,
    stream_client: reqwest::Client,
    health: Arc<HealthChecker>,
    balancer: Arc<LoadBalancer>,
}

impl UpstreamProxy {
    pub fn new(
        health: Arc<HealthChecker>,
        balancer: Arc<LoadBalancer>,
    ) -> Result<Self, ProxyError> {
        let sync_client = reqwest::Client::builder()
            .timeout(SYNC_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Configuration {
                message: format!("failed to build upstream client: {e}"),
            })?;
        // Streams are bounded by cancellation, not by a wall-clock timeout.
        let stream_client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Configuration {
                message: format!("failed to build streaming client: {e}"),
            })?;

        Ok(Self {
            sync_client,
            stream_client,
            health,
            balancer,
        })
    }

    /// Forward a non-streaming request, retrying across endpoints.
    ///
    /// `selection` is the endpoint chosen by the selector; `alternatives`
    /// are the other endpoints serving the same model, used for failover.
    pub async fn proxy_request(
        &self,
        req: &MessagesRequest,
        inbound_headers: &HeaderMap,
        selection: Endpoint,
        alternatives: &[Endpoint],
    ) -> Result<(MessagesResponse, ProxyMetadata), ProxyError> {
        let request_id = Uuid::new_v4().to_string();
        let mut tried: HashSet<String> = HashSet::new();
        let mut current = selection;
        let mut last_error: Option<ProxyError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let name = current.name();
            tried.insert(name.clone());
            let attempt_start = Instant::now();

            let mut body = req.clone();
            body.model = current.model.name.clone();
            body.stream = None;

            let url = messages_url(&current);
            let headers = build_upstream_headers(inbound_headers, &current);

            let send_result = {
                let _guard = ConnectionGuard::new(self.health.clone(), name.clone());
                self.sync_client
                    .post(&url)
                    .headers(headers)
                    .json(&body)
                    .send()
                    .await
            };
            let latency_ms = attempt_start.elapsed().as_millis() as u64;

            match send_result {
                Err(e) => {
                    warn!(endpoint = %name, attempt, error = %e, "upstream network error");
                    self.health.record_request(&name, false, latency_ms);
                    last_error = Some(ProxyError::Network(e));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status >= 400 {
                        let text = response.text().await.unwrap_or_default();
                        let latency_ms = attempt_start.elapsed().as_millis() as u64;
                        self.health.record_request(&name, false, latency_ms);
                        let upstream = UpstreamError { status, body: text };
                        if !is_retryable_status(status) {
                            return Err(ProxyError::Upstream(upstream));
                        }
                        debug!(endpoint = %name, status, attempt, "retryable upstream status");
                        last_error = Some(ProxyError::Upstream(upstream));
                    } else {
                        let parsed: MessagesResponse =
                            response.json().await.map_err(|e| {
                                self.health.record_request(
                                    &name,
                                    false,
                                    attempt_start.elapsed().as_millis() as u64,
                                );
                                ProxyError::InvalidResponse {
                                    message: e.to_string(),
                                }
                            })?;
                        let latency_ms = attempt_start.elapsed().as_millis() as u64;
                        self.health.record_request(&name, true, latency_ms);

                        let meta = ProxyMetadata {
                            request_id,
                            endpoint_name: name,
                            model_name: current.model.name.clone(),
                            input_tokens: parsed.usage.input_tokens,
                            output_tokens: parsed.usage.output_tokens,
                            latency_ms,
                            cost: compute_cost(
                                parsed.usage.input_tokens,
                                parsed.usage.output_tokens,
                                &current.model,
                            ),
                            status,
                            success: true,
                        };
                        return Ok((parsed, meta));
                    }
                }
            }

            match self.next_endpoint(&tried, req, alternatives).await {
                Some(next) => current = next,
                None => break,
            }
        }

        Err(ProxyError::AllEndpointsFailed {
            model: req.model.clone(),
            source: Box::new(last_error.unwrap_or(ProxyError::NoHealthyEndpoint {
                model: req.model.clone(),
            })),
        })
    }

    /// Open a streaming request. Retries happen only before the first byte:
    /// a connection failure or a pre-data error status moves to the next
    /// endpoint; once connected, the returned channel carries raw SSE bytes
    /// followed by exactly one terminal chunk.
    pub async fn proxy_stream_request(
        &self,
        req: &MessagesRequest,
        inbound_headers: &HeaderMap,
        selection: Endpoint,
        alternatives: &[Endpoint],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProxyError> {
        let request_id = Uuid::new_v4().to_string();
        let mut tried: HashSet<String> = HashSet::new();
        let mut current = selection;
        let mut last_error: Option<ProxyError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let name = current.name();
            tried.insert(name.clone());
            let attempt_start = Instant::now();

            let mut body = req.clone();
            body.model = current.model.name.clone();
            body.stream = Some(true);

            let url = messages_url(&current);
            let headers = build_upstream_headers(inbound_headers, &current);

            let connect = self
                .stream_client
                .post(&url)
                .headers(headers)
                .json(&body)
                .send();

            let response = tokio::select! {
                r = connect => r,
                _ = cancel.cancelled() => return Err(ProxyError::Canceled),
            };

            match response {
                Err(e) => {
                    warn!(endpoint = %name, attempt, error = %e, "stream connect failed");
                    self.health.record_request(
                        &name,
                        false,
                        attempt_start.elapsed().as_millis() as u64,
                    );
                    last_error = Some(ProxyError::Network(e));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status >= 400 {
                        let text = response.text().await.unwrap_or_default();
                        self.health.record_request(
                            &name,
                            false,
                            attempt_start.elapsed().as_millis() as u64,
                        );
                        let upstream = UpstreamError { status, body: text };
                        if !is_retryable_status(status) {
                            return Err(ProxyError::Upstream(upstream));
                        }
                        last_error = Some(ProxyError::Upstream(upstream));
                    } else {
                        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                        let reader = StreamReader {
                            health: self.health.clone(),
                            endpoint: current.clone(),
                            request_id,
                            started: attempt_start,
                        };
                        let guard = ConnectionGuard::new(self.health.clone(), name);
                        tokio::spawn(reader.run(response, tx, cancel, guard));
                        return Ok(rx);
                    }
                }
            }

            match self.next_endpoint(&tried, req, alternatives).await {
                Some(next) => current = next,
                None => break,
            }
        }

        Err(ProxyError::AllEndpointsFailed {
            model: req.model.clone(),
            source: Box::new(last_error.unwrap_or(ProxyError::NoHealthyEndpoint {
                model: req.model.clone(),
            })),
        })
    }

    /// Next endpoint for a retry: healthy, not yet tried, chosen by the
    /// load balancer.
    async fn next_endpoint(
        &self,
        tried: &HashSet<String>,
        req: &MessagesRequest,
        alternatives: &[Endpoint],
    ) -> Option<Endpoint> {
        let candidates: Vec<Endpoint> = alternatives
            .iter()
            .filter(|e| {
                let name = e.name();
                !tried.contains(&name) && self.health.is_healthy(&name)
            })
            .cloned()
            .collect();
        self.balancer.select(&candidates, req).await
    }
}

fn messages_url(endpoint: &Endpoint) -> String {
    format!(
        "{}/v1/messages",
        endpoint.provider.base_url.trim_end_matches('/')
    )
}

/// Build the upstream header set for an attempt.
///
/// Order matters: fixed headers first, then the allow-listed client
/// identification headers, then provider `custom_headers`, which win.
pub fn build_upstream_headers(inbound: &HeaderMap, endpoint: &Endpoint) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&endpoint.provider.api_key) {
        headers.insert("x-api-key", value);
    }

    let version = inbound
        .get("anthropic-version")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION));
    headers.insert("anthropic-version", version);

    for (name, value) in inbound.iter() {
        if forwardable_header(name.as_str()) {
            headers.insert(name.clone(), value.clone());
        }
    }

    for (key, value) in &endpoint.provider.custom_headers {
        if let (Ok(name), Ok(value)) = (
            key.parse::<HeaderName>(),
            value.parse::<HeaderValue>(),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

/// Client identification headers forwarded to the upstream.
fn forwardable_header(name: &str) -> bool {
    if name.eq_ignore_ascii_case("anthropic-version") {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower.starts_with("anthropic-")
        || lower.starts_with("x-stainless-")
        || lower.starts_with("x-claude-")
        || lower == "x-app"
        || lower == "x-client-app"
        || lower == "user-agent"
}

struct StreamReader {
    health: Arc<HealthChecker>,
    endpoint: Endpoint,
    request_id: String,
    started: Instant,
}

impl StreamReader {
    async fn run(
        self,
        response: reqwest::Response,
        tx: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
        guard: ConnectionGuard,
    ) {
        use futures::StreamExt;

        let name = self.endpoint.name();
        let mut bytes_stream = response.bytes_stream();
        let mut line_buffer = String::new();
        let mut input_tokens: Option<u32> = None;
        let mut output_tokens: Option<u32> = None;
        let mut first_byte_at: Option<Instant> = None;
        let mut stream_error: Option<ProxyError> = None;

        loop {
            let next = tokio::select! {
                chunk = bytes_stream.next() => chunk,
                _ = cancel.cancelled() => {
                    debug!(endpoint = %name, "stream canceled by client");
                    stream_error = Some(ProxyError::Canceled);
                    break;
                }
            };

            match next {
                None => break,
                Some(Err(e)) => {
                    warn!(endpoint = %name, error = %e, "stream read error");
                    stream_error = Some(ProxyError::Network(e));
                    break;
                }
                Some(Ok(chunk)) => {
                    if first_byte_at.is_none() {
                        first_byte_at = Some(Instant::now());
                    }

                    line_buffer.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(newline) = line_buffer.find('\n') {
                        let line: String = line_buffer.drain(..=newline).collect();
                        scan_usage_line(line.trim(), &mut input_tokens, &mut output_tokens);
                    }

                    if tx.send(StreamChunk::data(chunk.to_vec())).await.is_err() {
                        // Receiver dropped; nobody is listening anymore.
                        debug!(endpoint = %name, "stream receiver dropped");
                        stream_error = Some(ProxyError::Canceled);
                        break;
                    }
                }
            }
        }

        // Trailing partial line, if the stream ended without a newline.
        scan_usage_line(line_buffer.trim(), &mut input_tokens, &mut output_tokens);

        let success = stream_error.is_none();
        let latency_ms = first_byte_at
            .map(|t| t.duration_since(self.started))
            .unwrap_or_else(|| self.started.elapsed())
            .as_millis() as u64;

        self.health.record_request(&name, success, latency_ms);
        drop(guard);

        let input = input_tokens.unwrap_or(0);
        let output = output_tokens.unwrap_or(0);
        let meta = ProxyMetadata {
            request_id: self.request_id,
            endpoint_name: name,
            model_name: self.endpoint.model.name.clone(),
            input_tokens: input,
            output_tokens: output,
            latency_ms,
            cost: compute_cost(input, output, &self.endpoint.model),
            status: 200,
            success,
        };

        let _ = tx.send(StreamChunk::terminal(meta, stream_error)).await;
    }
}

/// Pull token counts out of one SSE line. The last observed values win;
/// Anthropic reports input tokens in `message_start` and running output
/// totals in `message_delta`.
fn scan_usage_line(line: &str, input_tokens: &mut Option<u32>, output_tokens: &mut Option<u32>) {
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return;
    };
    if payload.is_empty() || payload == "[DONE]" {
        return;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return;
    };

    for usage in [
        value.get("usage"),
        value.get("message").and_then(|m| m.get("usage")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(n) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
            *input_tokens = Some(n as u32);
        }
        if let Some(n) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
            *output_tokens = Some(n as u32);
        }
    }
}
