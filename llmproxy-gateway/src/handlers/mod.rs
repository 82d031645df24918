//! # HTTP Handlers
//!
//! The client-facing surface of the proxy:
//!
//! - `POST /v1/messages`: Anthropic-compatible messages endpoint,
//!   streaming and non-streaming. The body is transparent apart from the
//!   `model` field, which endpoint selection rewrites to the concrete
//!   upstream model.
//! - `GET /api/health`: unauthenticated endpoint status summary.
//!
//! Every served request (including failures and canceled streams) leaves a
//! row in the request log via the async sink; stream rows are written by
//! the relay task when the terminal chunk arrives, so a disconnected client
//! still gets recorded.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use llmproxy_core::models::{
    EndpointSelectionResult, MessagesRequest, ProxyMetadata, RequestLogEntry,
};
use llmproxy_core::proxy::STREAM_CHANNEL_CAPACITY;
use llmproxy_core::{ProxyError, RoutingConfig};

use crate::auth;
use crate::db::ApiKeyAuth;
use crate::gateway_error::GatewayError;
use crate::request_log::{all_matches_json, message_preview, routing_method};
use crate::server::AppState;

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessagesRequest>,
) -> Result<Response, GatewayError> {
    let key = auth::authenticate(&state.api_keys, &headers).await?;

    // One snapshot per request: selection and failover alternatives see the
    // same endpoint set even if a reload lands mid-request.
    let snapshot = state.endpoints.snapshot();
    let selection = match state.selector.select_with_snapshot(&req, &snapshot).await {
        Ok(selection) => selection,
        Err(e) => {
            error!(model = %req.model, error = %e, "endpoint selection failed");
            return Err(e.into());
        }
    };
    info!(
        model = %selection.model.name,
        endpoint = %selection.endpoint.name(),
        task_type = ?selection.task_type,
        fallback = ?selection.fallback_from,
        stream = req.is_stream(),
        "endpoint selected"
    );

    // Alternatives for failover: every endpoint serving the chosen model in
    // the snapshot this request started with.
    let alternatives: Vec<_> = snapshot
        .iter()
        .filter(|e| e.model.name == selection.model.name)
        .cloned()
        .collect();

    let routing_config = state
        .routing_config
        .load()
        .await
        .unwrap_or_else(|_| RoutingConfig::default());

    if req.is_stream() {
        stream_messages(state, req, headers, key, selection, alternatives, routing_config).await
    } else {
        sync_messages(state, req, headers, key, selection, alternatives, routing_config).await
    }
}

async fn sync_messages(
    state: AppState,
    req: MessagesRequest,
    headers: HeaderMap,
    key: ApiKeyAuth,
    selection: EndpointSelectionResult,
    alternatives: Vec<llmproxy_core::Endpoint>,
    routing_config: RoutingConfig,
) -> Result<Response, GatewayError> {
    let result = state
        .proxy
        .proxy_request(&req, &headers, selection.endpoint.clone(), &alternatives)
        .await;

    match result {
        Ok((response, meta)) => {
            let response_body = routing_config
                .log_full_content
                .then(|| serde_json::to_string(&response).unwrap_or_default());
            let entry = build_log_entry(
                &req,
                &selection,
                &key,
                &meta,
                false,
                &routing_config,
                response_body,
            );
            state.sink.log_request(entry).await;

            Ok((StatusCode::OK, Json(response)).into_response())
        }
        Err(e) => {
            let meta = failure_metadata(&selection, &e);
            let entry =
                build_log_entry(&req, &selection, &key, &meta, false, &routing_config, None);
            state.sink.log_request(entry).await;
            Err(e.into())
        }
    }
}

async fn stream_messages(
    state: AppState,
    req: MessagesRequest,
    headers: HeaderMap,
    key: ApiKeyAuth,
    selection: EndpointSelectionResult,
    alternatives: Vec<llmproxy_core::Endpoint>,
    routing_config: RoutingConfig,
) -> Result<Response, GatewayError> {
    let cancel = CancellationToken::new();
    let mut rx = match state
        .proxy
        .proxy_stream_request(
            &req,
            &headers,
            selection.endpoint.clone(),
            &alternatives,
            cancel.clone(),
        )
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            let meta = failure_metadata(&selection, &e);
            let entry =
                build_log_entry(&req, &selection, &key, &meta, true, &routing_config, None);
            state.sink.log_request(entry).await;
            return Err(e.into());
        }
    };

    let (body_tx, body_rx) =
        tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(STREAM_CHANNEL_CAPACITY);

    // Relay upstream chunks into the response body. On client disconnect the
    // upstream read is canceled, but the relay keeps draining so the
    // terminal chunk is still observed and the request still gets logged.
    let sink = state.sink.clone();
    tokio::spawn(async move {
        let mut client_gone = false;
        while let Some(chunk) = rx.recv().await {
            if let Some(data) = chunk.data {
                if !client_gone && body_tx.send(Ok(Bytes::from(data))).await.is_err() {
                    client_gone = true;
                    cancel.cancel();
                }
            }
            if chunk.done {
                let meta = chunk.meta.unwrap_or_default();
                let entry =
                    build_log_entry(&req, &selection, &key, &meta, true, &routing_config, None);
                sink.log_request(entry).await;
                break;
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(body_rx));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let states = state.health.all_states();
    let mut endpoints: Vec<_> = states
        .iter()
        .map(|(name, s)| {
            json!({
                "name": name,
                "status": s.status.as_str(),
                "current_connections": s.current_connections,
                "total_requests": s.total_requests,
                "total_errors": s.total_errors,
                "avg_latency_ms": s.avg_latency_ms,
                "last_error": s.last_error,
            })
        })
        .collect();
    endpoints.sort_by_key(|e| e["name"].as_str().unwrap_or_default().to_string());

    let healthy = states
        .values()
        .filter(|s| s.status == llmproxy_core::EndpointStatus::Healthy)
        .count();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "endpoints_total": states.len(),
        "endpoints_healthy": healthy,
        "endpoints": endpoints,
    }))
}

fn failure_metadata(selection: &EndpointSelectionResult, error: &ProxyError) -> ProxyMetadata {
    ProxyMetadata {
        request_id: Uuid::new_v4().to_string(),
        endpoint_name: selection.endpoint.name(),
        model_name: selection.model.name.clone(),
        status: error.upstream().map(|u| u.status).unwrap_or(0),
        success: false,
        ..Default::default()
    }
}

fn build_log_entry(
    req: &MessagesRequest,
    selection: &EndpointSelectionResult,
    key: &ApiKeyAuth,
    meta: &ProxyMetadata,
    stream: bool,
    routing_config: &RoutingConfig,
    response_body: Option<String>,
) -> RequestLogEntry {
    let decision = selection.decision.as_ref();
    let matched = selection
        .rule_match
        .as_ref()
        .and_then(|r| r.matched.as_ref());

    RequestLogEntry {
        request_id: meta.request_id.clone(),
        user_id: key.user_id,
        api_key_id: Some(key.id),
        model_name: meta.model_name.clone(),
        endpoint_name: meta.endpoint_name.clone(),
        task_type: selection
            .task_type
            .map(|t| t.to_string())
            .unwrap_or_default(),
        input_tokens: meta.input_tokens,
        output_tokens: meta.output_tokens,
        latency_ms: meta.latency_ms,
        cost: meta.cost,
        status: meta.status,
        success: meta.success,
        stream,
        message_preview: message_preview(&req.last_user_text()),
        request_body: routing_config
            .log_full_content
            .then(|| serde_json::to_string(req).unwrap_or_default()),
        response_body,
        routing_method: routing_method(decision),
        routing_reason: decision.map(|d| d.reason.clone()).unwrap_or_default(),
        matched_rule_id: matched.map(|m| m.rule_id),
        matched_rule_name: matched.map(|m| m.rule_name.clone()),
        all_matches: all_matches_json(selection.rule_match.as_ref()),
        is_inaccurate: false,
        created_at: chrono::Utc::now(),
    }
}
