//! # LLM Router
//!
//! Orchestrates the routing decision pipeline for one request:
//!
//! 1. Load the routing configuration; extract the last user message and
//!    strip tool-injected tags from it.
//! 2. Rule-based classification when enabled, with the configured fallback
//!    strategy on a miss.
//! 3. Exact cache probes (in-process L1, durable L2), then the semantic L3
//!    layer when enabled.
//! 4. A call to the configured router model, with retry and a fallback
//!    model, parsing a decision JSON out of the model's reply.
//!
//! Routing never fails the client request: any unrecoverable step returns
//! `(default, no decision)` and the proxy carries on.

use regex::Regex;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{cache_key, normalize_content, RouteCache};
use crate::models::{
    CacheEntry, ClassifyResult, FallbackStrategy, MessagesRequest, RoutingConfig, RoutingDecision,
    RoutingModel, TaskType,
};
use crate::rules::RuleClassifier;
use crate::stores::{RouteCacheStore, RoutingConfigStore, RoutingRuleStore};

const ROUTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);
const EMBEDDING_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SYSTEM_PREVIEW_CHARS: usize = 1000;
const MAX_USER_PREVIEW_CHARS: usize = 3000;
const PREVIEW_CHARS: usize = 200;

const ROUTER_SYSTEM_PROMPT: &str = "You are a task-complexity classifier for an LLM proxy. \
Read the user message and decide which model tier should serve it. \
Reply with a single JSON object: {\"task_type\": \"simple\" | \"default\" | \"complex\", \
\"reason\": \"<one short sentence>\"}. \
Use \"simple\" for greetings, small talk and trivial lookups; \"complex\" for system design, \
deep reasoning, long multi-step analysis or large code generation; \"default\" otherwise.";

/// The routing pipeline's answer for one request.
#[derive(Debug, Clone)]
pub struct InferredRoute {
    pub task_type: TaskType,
    pub decision: Option<RoutingDecision>,
    /// Populated when the rule classifier produced the decision
    pub rule_match: Option<ClassifyResult>,
}

impl InferredRoute {
    fn fallthrough() -> Self {
        Self {
            task_type: TaskType::Default,
            decision: None,
            rule_match: None,
        }
    }
}

/// Decision pipeline over rules, caches and router models.
pub struct LlmRouter {
    config_store: Arc<dyn RoutingConfigStore>,
    rule_store: Arc<dyn RoutingRuleStore>,
    cache_store: Arc<dyn RouteCacheStore>,
    classifier: RwLock<Arc<RuleClassifier>>,
    l1: RouteCache,
    http: reqwest::Client,
    embed_http: reqwest::Client,
}

impl LlmRouter {
    /// Build the router, loading rules and cache sizing from the stores.
    /// Store failures degrade to builtin rules and default sizing.
    pub async fn new(
        config_store: Arc<dyn RoutingConfigStore>,
        rule_store: Arc<dyn RoutingRuleStore>,
        cache_store: Arc<dyn RouteCacheStore>,
    ) -> Arc<Self> {
        let config = match config_store.load().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "routing config unavailable at startup, using defaults");
                RoutingConfig::default()
            }
        };
        let rules = match rule_store.list_rules().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "custom rules unavailable, using builtins only");
                Vec::new()
            }
        };

        let l1 = RouteCache::new(
            config.l1_capacity.max(1),
            Duration::from_secs(config.l1_ttl_secs.max(1)),
        );
        let http = reqwest::Client::builder()
            .timeout(ROUTER_CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        let embed_http = reqwest::Client::builder()
            .timeout(EMBEDDING_CALL_TIMEOUT)
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            config_store,
            rule_store,
            cache_store,
            classifier: RwLock::new(Arc::new(RuleClassifier::new(rules))),
            l1,
            http,
            embed_http,
        })
    }

    /// Rebuild the classifier from the store, e.g. after rules change.
    pub async fn reload_rules(&self) {
        match self.rule_store.list_rules().await {
            Ok(rules) => {
                *self.classifier.write().unwrap() = Arc::new(RuleClassifier::new(rules));
            }
            Err(e) => warn!(error = %e, "rule reload failed, keeping current rule set"),
        }
    }

    /// Infer the task role for a request.
    pub async fn infer_task_type(&self, req: &MessagesRequest) -> InferredRoute {
        let config = match self.config_store.load().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "routing config load failed, defaulting");
                return InferredRoute::fallthrough();
            }
        };

        let raw_user = req.last_user_text();
        let stripped = strip_system_injections(&raw_user);
        let user_msg = stripped.trim();
        if user_msg.is_empty() {
            return InferredRoute::fallthrough();
        }
        let system_content = req.system_text();

        if config.rule_based_enabled {
            let classifier = self.classifier.read().unwrap().clone();
            let result = classifier.classify(user_msg);
            if let Some(winner) = result.matched.clone() {
                let store = self.rule_store.clone();
                let rule_id = winner.rule_id;
                tokio::spawn(async move {
                    if let Err(e) = store.increment_hit(rule_id).await {
                        debug!(rule_id, error = %e, "rule hit-count update failed");
                    }
                });
                let decision = RoutingDecision {
                    task_type: result.task_type,
                    reason: result.reason.clone(),
                    from_cache: false,
                    cache_type: "rule".to_string(),
                    model_used: String::new(),
                };
                return InferredRoute {
                    task_type: result.task_type,
                    decision: Some(decision),
                    rule_match: Some(result),
                };
            }

            match config.fallback_strategy {
                FallbackStrategy::Default => {
                    return self.fallback_route(TaskType::Default, "fallback: no rule matched")
                }
                FallbackStrategy::User => {
                    return self.fallback_route(
                        config.fallback_task_type,
                        "fallback: operator-configured task type",
                    )
                }
                FallbackStrategy::Llm => {}
            }
        }

        if !config.llm_enabled {
            return self.fallback_route(TaskType::Default, "fallback: LLM routing disabled");
        }

        let key = cache_key(user_msg);

        if let Some(hit) = self.l1.get(&key) {
            return cached_route(hit.task_type, hit.reason, "L1");
        }

        match self.cache_store.get_exact(&key).await {
            Ok(Some(entry)) => {
                self.l1.insert(&key, entry.task_type, &entry.reason);
                let store = self.cache_store.clone();
                let hit_key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.increment_hit(&hit_key).await {
                        debug!(error = %e, "cache hit-count update failed");
                    }
                });
                return cached_route(entry.task_type, entry.reason, "L2");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "L2 cache lookup failed, treating as miss"),
        }

        let mut embedding: Option<Vec<f32>> = None;
        if config.semantic_cache_enabled && config.embedding_model_id > 0 {
            if let Some(vector) = self.embed(&config, user_msg).await {
                match self
                    .cache_store
                    .best_semantic_match(&vector, config.similarity_threshold)
                    .await
                {
                    Ok(Some((entry, similarity))) => {
                        return cached_route(
                            entry.task_type,
                            format!("semantic match ({similarity:.3}): {}", entry.reason),
                            "L3",
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "L3 cache lookup failed, treating as miss"),
                }
                embedding = Some(vector);
            }
        }

        let Some((task_type, reason, model_used)) = self
            .call_router(&config, &system_content, user_msg)
            .await
        else {
            return InferredRoute::fallthrough();
        };

        self.l1.insert(&key, task_type, &reason);
        let entry = CacheEntry {
            content_hash: key,
            content_preview: truncate_chars(&normalize_content(user_msg), PREVIEW_CHARS),
            embedding,
            task_type,
            reason: reason.clone(),
            created_at: chrono::Utc::now(),
            hit_count: 0,
        };
        if let Err(e) = self.cache_store.insert(&entry).await {
            warn!(error = %e, "routing cache write failed");
        }

        InferredRoute {
            task_type,
            decision: Some(RoutingDecision {
                task_type,
                reason,
                from_cache: false,
                cache_type: String::new(),
                model_used,
            }),
            rule_match: None,
        }
    }

    fn fallback_route(&self, task_type: TaskType, reason: &str) -> InferredRoute {
        InferredRoute {
            task_type,
            decision: Some(RoutingDecision {
                task_type,
                reason: reason.to_string(),
                from_cache: false,
                cache_type: String::new(),
                model_used: String::new(),
            }),
            rule_match: None,
        }
    }

    /// Call the router model with a retry budget of `retry_count + 1`,
    /// switching to the fallback model after the first failure.
    async fn call_router(
        &self,
        config: &RoutingConfig,
        system_content: &str,
        user_msg: &str,
    ) -> Option<(TaskType, String, String)> {
        let primary = self.load_routing_model(config.router_model_id).await;
        let fallback = if config.fallback_model_id > 0
            && config.fallback_model_id != config.router_model_id
        {
            self.load_routing_model(config.fallback_model_id).await
        } else {
            None
        };

        let attempts = config.retry_count.saturating_add(1);
        for attempt in 0..attempts {
            let model = if attempt == 0 {
                primary.as_ref().or(fallback.as_ref())
            } else {
                fallback.as_ref().or(primary.as_ref())
            };
            let Some(model) = model else {
                warn!("no router model configured");
                return None;
            };

            match self
                .request_decision(model, config, system_content, user_msg)
                .await
            {
                Ok(Some((task_type, reason))) => {
                    return Some((task_type, reason, model.model.clone()))
                }
                Ok(None) => {
                    warn!(model = %model.model, attempt, "router reply had no parseable decision")
                }
                Err(e) => warn!(model = %model.model, attempt, error = %e, "router call failed"),
            }
        }
        None
    }

    async fn load_routing_model(&self, id: i64) -> Option<RoutingModel> {
        if id <= 0 {
            return None;
        }
        match self.config_store.routing_model(id).await {
            Ok(Some(model)) if model.enabled => Some(model),
            Ok(_) => None,
            Err(e) => {
                warn!(id, error = %e, "routing model load failed");
                None
            }
        }
    }

    async fn request_decision(
        &self,
        model: &RoutingModel,
        config: &RoutingConfig,
        system_content: &str,
        user_msg: &str,
    ) -> Result<Option<(TaskType, String)>, reqwest::Error> {
        let user_prompt = if system_content.is_empty() {
            format!(
                "User message:\n{}",
                truncate_chars(user_msg, MAX_USER_PREVIEW_CHARS)
            )
        } else {
            format!(
                "System context:\n{}\n\nUser message:\n{}",
                truncate_chars(system_content, MAX_SYSTEM_PREVIEW_CHARS),
                truncate_chars(user_msg, MAX_USER_PREVIEW_CHARS)
            )
        };

        let body = RouterChatRequest {
            model: &model.model,
            messages: vec![
                RouterMessage {
                    role: "system",
                    content: ROUTER_SYSTEM_PROMPT.to_string(),
                },
                RouterMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        let url = format!(
            "{}/v1/chat/completions",
            model.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&model.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: RouterChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(parse_decision(&content))
    }

    /// Embed a message through the configured embedding model, trying the
    /// OpenAI path first and the bare `/embeddings` path on 404.
    async fn embed(&self, config: &RoutingConfig, text: &str) -> Option<Vec<f32>> {
        let model = self.load_routing_model(config.embedding_model_id).await?;
        let body = EmbeddingsRequest {
            model: &model.model,
            input: text,
        };

        for path in ["/v1/embeddings", "/embeddings"] {
            let url = format!("{}{}", model.base_url.trim_end_matches('/'), path);
            match self
                .embed_http
                .post(&url)
                .bearer_auth(&model.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<EmbeddingsResponse>()
                        .await
                        .ok()?
                        .data
                        .into_iter()
                        .next()
                        .map(|row| row.embedding);
                }
                Ok(resp) if resp.status().as_u16() == 404 => continue,
                Ok(resp) => {
                    warn!(status = resp.status().as_u16(), "embedding call rejected");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "embedding call failed");
                    return None;
                }
            }
        }
        None
    }
}

fn cached_route(task_type: TaskType, reason: impl Into<String>, layer: &str) -> InferredRoute {
    let reason = reason.into();
    InferredRoute {
        task_type,
        decision: Some(RoutingDecision {
            task_type,
            reason,
            from_cache: true,
            cache_type: layer.to_string(),
            model_used: String::new(),
        }),
        rule_match: None,
    }
}

/// Remove tool-injected tags (`<system-reminder>` blocks and similar) from a
/// user message before classification or caching.
pub fn strip_system_injections(message: &str) -> String {
    static TAGS: OnceLock<Vec<Regex>> = OnceLock::new();
    let tags = TAGS.get_or_init(|| {
        [
            r"(?s)<system-reminder>.*?</system-reminder>",
            r"(?s)<system-warning>.*?</system-warning>",
            r"(?s)<command-name>.*?</command-name>",
            r"(?s)<command-message>.*?</command-message>",
            r"(?s)<command-args>.*?</command-args>",
            r"(?s)<local-command-stdout>.*?</local-command-stdout>",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    });

    let mut out = message.to_string();
    for re in tags.iter() {
        out = re.replace_all(&out, "").into_owned();
    }
    out.trim().to_string()
}

/// Extract a routing decision from a router model reply. Accepts a bare
/// JSON object, a fenced block, or an object embedded in prose.
pub fn parse_decision(content: &str) -> Option<(TaskType, String)> {
    let trimmed = content.trim();

    if let Some(found) = decision_from_json(trimmed) {
        return Some(found);
    }

    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static pattern")
    });
    if let Some(caps) = fenced.captures(trimmed) {
        if let Some(found) = decision_from_json(caps.get(1).unwrap().as_str()) {
            return Some(found);
        }
    }

    static EMBEDDED: OnceLock<Regex> = OnceLock::new();
    let embedded = EMBEDDED.get_or_init(|| {
        Regex::new(r#"(?s)\{[^{}]*"task_type"\s*:\s*"[^"]*"[^{}]*\}"#).expect("static pattern")
    });
    if let Some(m) = embedded.find(trimmed) {
        if let Some(found) = decision_from_json(m.as_str()) {
            return Some(found);
        }
    }

    None
}

fn decision_from_json(raw: &str) -> Option<(TaskType, String)> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let task = value.get("task_type")?.as_str()?;
    let reason = value
        .get("reason")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    Some((TaskType::parse(task), reason))
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

#[derive(serde::Serialize)]
struct RouterChatRequest<'a> {
    model: &'a str,
    messages: Vec<RouterMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(serde::Serialize)]
struct RouterMessage {
    role: &'static str,
    content: String,
}

#[derive(serde::Deserialize)]
struct RouterChatResponse {
    #[serde(default)]
    choices: Vec<RouterChoice>,
}

#[derive(serde::Deserialize)]
struct RouterChoice {
    message: RouterChoiceMessage,
}

#[derive(serde::Deserialize)]
struct RouterChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(serde::Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingRow>,
}

#[derive(serde::Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_decision() {
        let (task, reason) =
            parse_decision(r#"{"task_type": "complex", "reason": "system design"}"#).unwrap();
        assert_eq!(task, TaskType::Complex);
        assert_eq!(reason, "system design");
    }

    #[test]
    fn parses_fenced_decision() {
        let content = "Here you go:\n```json\n{\"task_type\": \"simple\", \"reason\": \"greeting\"}\n```\nDone.";
        let (task, reason) = parse_decision(content).unwrap();
        assert_eq!(task, TaskType::Simple);
        assert_eq!(reason, "greeting");

        let bare_fence = "```\n{\"task_type\": \"default\", \"reason\": \"x\"}\n```";
        assert_eq!(parse_decision(bare_fence).unwrap().0, TaskType::Default);
    }

    #[test]
    fn parses_decision_embedded_in_prose() {
        let content = r#"I think this is straightforward. {"task_type":"simple","reason":"short lookup"} Hope that helps!"#;
        let (task, reason) = parse_decision(content).unwrap();
        assert_eq!(task, TaskType::Simple);
        assert_eq!(reason, "short lookup");
    }

    #[test]
    fn unknown_task_types_coerce_to_default() {
        let (task, _) =
            parse_decision(r#"{"task_type": "SUPER-HARD", "reason": "??"}"#).unwrap();
        assert_eq!(task, TaskType::Default);
        let (task, _) = parse_decision(r#"{"task_type": "Complex", "reason": ""}"#).unwrap();
        assert_eq!(task, TaskType::Complex);
    }

    #[test]
    fn rejects_replies_without_task_type() {
        assert!(parse_decision("no json here").is_none());
        assert!(parse_decision(r#"{"reason": "missing the label"}"#).is_none());
        assert!(parse_decision("").is_none());
    }

    #[test]
    fn strips_injected_tags() {
        let message = "please fix this\n<system-reminder>\nbe terse\n</system-reminder>\nthanks";
        assert_eq!(strip_system_injections(message), "please fix this\n\nthanks");

        let command = "<command-name>/clear</command-name><command-message>clear</command-message>";
        assert_eq!(strip_system_injections(command), "");

        let untouched = "a plain message with <b>markup</b>";
        assert_eq!(strip_system_injections(untouched), untouched);
    }

    #[test]
    fn truncation_is_char_based() {
        assert_eq!(truncate_chars("微服务架构设计", 4), "微服务架");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
