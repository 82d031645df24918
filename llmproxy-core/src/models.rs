//! # Data Model
//!
//! Core types shared across the engine: the Anthropic messages wire schema
//! (kept transparent apart from the `model` field), the served-model catalog
//! (models, providers, endpoints), routing rules and decisions, cache
//! entries, request-log records and worker registrations.
//!
//! ## Wire transparency
//!
//! [`MessagesRequest`] models only the fields the proxy needs to read or
//! rewrite (`model`, `messages`, `system`, `stream`); everything else is
//! captured in a flattened map and forwarded to the upstream untouched.
//!
//! ## Snapshots
//!
//! [`Endpoint`] values are plain owned data. The endpoint store hands out
//! `Arc<Vec<Endpoint>>` snapshots; a request keeps the snapshot it started
//! with for its whole lifetime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Task role inferred for a request: which model tier should serve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Lightweight requests (greetings, short lookups)
    Simple,
    /// The general-purpose tier
    #[default]
    Default,
    /// Requests that need the strongest model (design, deep reasoning)
    Complex,
}

impl TaskType {
    /// Parse a task type, coercing unknown or empty strings to `Default`.
    pub fn parse(s: &str) -> TaskType {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => TaskType::Simple,
            "complex" => TaskType::Complex,
            _ => TaskType::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Simple => "simple",
            TaskType::Default => "default",
            TaskType::Complex => "complex",
        }
    }

    /// Role fallback order used by the endpoint selector. The first role with
    /// a healthy model wins.
    pub fn fallback_chain(&self) -> &'static [TaskType] {
        match self {
            TaskType::Simple => &[TaskType::Simple, TaskType::Default, TaskType::Complex],
            TaskType::Default => &[TaskType::Default, TaskType::Complex],
            TaskType::Complex => &[TaskType::Complex, TaskType::Default],
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Anthropic wire schema
// ---------------------------------------------------------------------------

/// An inbound Anthropic `POST /v1/messages` request.
///
/// Unmodeled fields (tools, metadata, top_p, ...) ride along in `extra` and
/// are serialized back out verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessagesRequest {
    /// Text of the last user message, with content blocks flattened.
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.text())
            .unwrap_or_default()
    }

    /// Text of the first message regardless of role. Used by the
    /// conversation-hash balancer so one conversation sticks to one endpoint.
    pub fn first_message_text(&self) -> String {
        self.messages
            .first()
            .map(|m| m.content.text())
            .unwrap_or_default()
    }

    /// Flattened system prompt content, empty when absent.
    pub fn system_text(&self) -> String {
        match &self.system {
            Some(SystemPrompt::Text(t)) => t.clone(),
            Some(SystemPrompt::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// A single conversation turn. Roles are kept as strings so unknown roles
/// pass through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// System prompt: bare string or content blocks, mirroring the messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A typed content block. Non-text block payloads stay in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentBlock {
    pub fn text_block(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// An upstream Anthropic messages response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Served-model catalog
// ---------------------------------------------------------------------------

/// A named served target ("claude-sonnet-4"), unique by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub role: TaskType,
    /// Cost per million input tokens, in account currency
    pub cost_per_mtok_input: f64,
    /// Cost per million output tokens, before the billing multiplier
    pub cost_per_mtok_output: f64,
    pub billing_multiplier: f64,
    /// Selection tie-break weight inside a role; non-positive means "last resort"
    pub weight: i64,
    pub enabled: bool,
}

/// An upstream provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Load-balancer weight across providers serving the same model
    pub weight: i64,
    pub max_concurrency: u32,
    /// Header overrides applied last when building the upstream request
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    pub enabled: bool,
}

/// A reachable (provider, model) pair: the unit of health tracking, load
/// balancing and retry.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub provider: Provider,
    pub model: Model,
}

impl Endpoint {
    /// Display name, unique across the snapshot: `"<provider>/<model>"`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.provider.name, self.model.name)
    }
}

/// Probe status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Unhealthy => "unhealthy",
            EndpointStatus::Unknown => "unknown",
        }
    }
}

/// Copy-safe snapshot of an endpoint's mutable counters.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointState {
    pub status: EndpointStatus,
    pub current_connections: i64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Routing rules, decisions and configuration
// ---------------------------------------------------------------------------

/// A routing rule. Built-in rules carry negative ids and can be overridden
/// by a custom rule of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: i64,
    pub name: String,
    /// Substring keywords; any hit matches the rule
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Optional regex pattern
    #[serde(default)]
    pub pattern: String,
    /// Optional condition expression (see the `dsl` module)
    #[serde(default)]
    pub condition: String,
    pub task_type: TaskType,
    /// Higher priority wins; ties break by order of appearance
    pub priority: i64,
    pub is_builtin: bool,
    pub enabled: bool,
    #[serde(default)]
    pub hit_count: i64,
}

/// One rule that matched a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule_id: i64,
    pub rule_name: String,
    pub priority: i64,
    pub task_type: TaskType,
    pub reason: String,
}

/// Outcome of running the rule classifier over one message.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyResult {
    pub task_type: TaskType,
    /// The winning (highest-priority) hit, if any rule matched
    pub matched: Option<RuleHit>,
    /// Every rule that matched, for observability
    pub hits: Vec<RuleHit>,
    pub reason: String,
}

/// What to do when rule-based routing produces no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Return the default role immediately
    #[default]
    Default,
    /// Continue into the LLM routing pipeline
    Llm,
    /// Return an operator-configured role
    User,
}

impl FallbackStrategy {
    pub fn parse(s: &str) -> FallbackStrategy {
        match s.trim().to_ascii_lowercase().as_str() {
            "llm" => FallbackStrategy::Llm,
            "user" => FallbackStrategy::User,
            _ => FallbackStrategy::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Default => "default",
            FallbackStrategy::Llm => "llm",
            FallbackStrategy::User => "user",
        }
    }
}

/// Singleton routing configuration (durable row id = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub rule_based_enabled: bool,
    pub llm_enabled: bool,
    pub semantic_cache_enabled: bool,
    pub l1_ttl_secs: u64,
    pub l1_capacity: usize,
    pub l2_ttl_secs: u64,
    pub l3_ttl_secs: u64,
    /// Primary router model id in the routing_models table
    pub router_model_id: i64,
    /// Fallback router model id, used after the primary fails
    pub fallback_model_id: i64,
    /// Embedding model id for the semantic cache, 0 when unset
    pub embedding_model_id: i64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry_count: u32,
    pub similarity_threshold: f32,
    pub fallback_strategy: FallbackStrategy,
    pub fallback_task_type: TaskType,
    pub force_smart_routing: bool,
    pub log_full_content: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rule_based_enabled: true,
            llm_enabled: false,
            semantic_cache_enabled: false,
            l1_ttl_secs: 300,
            l1_capacity: 10_000,
            l2_ttl_secs: 24 * 3600,
            l3_ttl_secs: 7 * 24 * 3600,
            router_model_id: 0,
            fallback_model_id: 0,
            embedding_model_id: 0,
            temperature: 0.0,
            max_tokens: 256,
            retry_count: 1,
            similarity_threshold: 0.82,
            fallback_strategy: FallbackStrategy::Default,
            fallback_task_type: TaskType::Default,
            force_smart_routing: false,
            log_full_content: false,
        }
    }
}

/// A router or embedding target: an OpenAI-compatible endpoint plus model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingModel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub enabled: bool,
}

/// How a routing decision was reached, carried through to the request log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_type: TaskType,
    pub reason: String,
    pub from_cache: bool,
    /// One of "L1", "L2", "L3", "rule" or "" for the LLM/fallback paths
    pub cache_type: String,
    /// Router model name for LLM-made decisions, empty otherwise
    pub model_used: String,
}

/// A routing-cache entry. Entries without an embedding are valid for exact
/// lookups but invisible to semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: String,
    /// First 200 chars of the normalized content, for operator inspection
    pub content_preview: String,
    pub embedding: Option<Vec<f32>>,
    pub task_type: TaskType,
    pub reason: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub hit_count: i64,
}

/// Load-balancing strategy tag, read from durable config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    Weighted,
    RoundRobin,
    ConversationHash,
    LeastConnections,
}

impl LoadBalanceStrategy {
    pub fn parse(s: &str) -> LoadBalanceStrategy {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => LoadBalanceStrategy::RoundRobin,
            "conversation_hash" => LoadBalanceStrategy::ConversationHash,
            "least_connections" => LoadBalanceStrategy::LeastConnections,
            _ => LoadBalanceStrategy::Weighted,
        }
    }
}

// ---------------------------------------------------------------------------
// Selection and proxy results
// ---------------------------------------------------------------------------

/// Result of endpoint selection for one request.
#[derive(Debug, Clone)]
pub struct EndpointSelectionResult {
    pub endpoint: Endpoint,
    pub model: Model,
    /// Inferred role when smart routing ran
    pub task_type: Option<TaskType>,
    pub decision: Option<RoutingDecision>,
    pub rule_match: Option<ClassifyResult>,
    /// Human-readable origin when a fallback substituted the requested
    /// model or role, e.g. `"model claude-opus-4"` or `"role simple"`
    pub fallback_from: Option<String>,
}

/// Final accounting for one proxied request or stream.
#[derive(Debug, Clone, Default)]
pub struct ProxyMetadata {
    pub request_id: String,
    pub endpoint_name: String,
    pub model_name: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// For streams this is time to first byte when any byte arrived
    pub latency_ms: u64,
    pub cost: f64,
    pub status: u16,
    pub success: bool,
}

/// One unit delivered on a stream channel: either raw SSE bytes to forward
/// verbatim, or the terminal chunk carrying the final metadata.
#[derive(Debug)]
pub struct StreamChunk {
    pub data: Option<Vec<u8>>,
    pub done: bool,
    pub error: Option<crate::error::ProxyError>,
    pub meta: Option<ProxyMetadata>,
}

impl StreamChunk {
    pub fn data(bytes: Vec<u8>) -> Self {
        Self {
            data: Some(bytes),
            done: false,
            error: None,
            meta: None,
        }
    }

    pub fn terminal(meta: ProxyMetadata, error: Option<crate::error::ProxyError>) -> Self {
        Self {
            data: None,
            done: true,
            error,
            meta: Some(meta),
        }
    }
}

/// Request cost from token counts and the served model's pricing. The
/// billing multiplier applies to the output term only.
pub fn compute_cost(input_tokens: u32, output_tokens: u32, model: &Model) -> f64 {
    input_tokens as f64 / 1e6 * model.cost_per_mtok_input
        + output_tokens as f64 / 1e6 * model.cost_per_mtok_output * model.billing_multiplier
}

// ---------------------------------------------------------------------------
// Request log and worker registry
// ---------------------------------------------------------------------------

/// Durable record of one served request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub model_name: String,
    pub endpoint_name: String,
    pub task_type: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub cost: f64,
    pub status: u16,
    pub success: bool,
    pub stream: bool,
    /// First 200 chars of the user message
    pub message_preview: String,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    /// "rule", "llm", "cache_l1".."cache_l3" or "fallback"
    pub routing_method: String,
    pub routing_reason: String,
    pub matched_rule_id: Option<i64>,
    pub matched_rule_name: Option<String>,
    /// JSON-serialized list of all rule hits
    pub all_matches: Option<String>,
    /// Operator flag for misrouted requests
    pub is_inaccurate: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One proxy process registered in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: uuid::Uuid,
    pub pid: u32,
    pub is_primary: bool,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_coercion() {
        assert_eq!(TaskType::parse("Simple"), TaskType::Simple);
        assert_eq!(TaskType::parse("COMPLEX"), TaskType::Complex);
        assert_eq!(TaskType::parse("default"), TaskType::Default);
        assert_eq!(TaskType::parse("gibberish"), TaskType::Default);
        assert_eq!(TaskType::parse(""), TaskType::Default);
    }

    #[test]
    fn fallback_chains() {
        assert_eq!(
            TaskType::Simple.fallback_chain(),
            &[TaskType::Simple, TaskType::Default, TaskType::Complex]
        );
        assert_eq!(
            TaskType::Default.fallback_chain(),
            &[TaskType::Default, TaskType::Complex]
        );
        assert_eq!(
            TaskType::Complex.fallback_chain(),
            &[TaskType::Complex, TaskType::Default]
        );
    }

    #[test]
    fn request_roundtrip_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hello"}],
            "metadata": {"user_id": "u-1"},
            "top_p": 0.9
        });
        let req: MessagesRequest = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(req.model, "claude-sonnet-4");
        assert_eq!(req.last_user_text(), "hello");

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["metadata"]["user_id"], "u-1");
        assert_eq!(back["top_p"], 0.9);
    }

    #[test]
    fn last_user_text_flattens_blocks() {
        let req: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [
                    {"type": "text", "text": "part one"},
                    {"type": "text", "text": "part two"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(req.last_user_text(), "part one\npart two");
        assert_eq!(req.first_message_text(), "first");
    }

    #[test]
    fn cost_formula() {
        let model = Model {
            id: 1,
            name: "m".to_string(),
            role: TaskType::Default,
            cost_per_mtok_input: 3.0,
            cost_per_mtok_output: 15.0,
            billing_multiplier: 1.2,
            weight: 1,
            enabled: true,
        };
        let cost = compute_cost(1_000_000, 2_000_000, &model);
        assert!((cost - (3.0 + 2.0 * 15.0 * 1.2)).abs() < 1e-6);
    }

    #[test]
    fn endpoint_display_name() {
        let e = Endpoint {
            provider: Provider {
                id: 1,
                name: "acme".to_string(),
                base_url: "https://api.acme.dev".to_string(),
                api_key: "sk".to_string(),
                weight: 1,
                max_concurrency: 10,
                custom_headers: HashMap::new(),
                enabled: true,
            },
            model: Model {
                id: 1,
                name: "claude-sonnet-4".to_string(),
                role: TaskType::Default,
                cost_per_mtok_input: 0.0,
                cost_per_mtok_output: 0.0,
                billing_multiplier: 1.0,
                weight: 0,
                enabled: true,
            },
        };
        assert_eq!(e.name(), "acme/claude-sonnet-4");
    }
}
