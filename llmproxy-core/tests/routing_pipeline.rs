//! Routing pipeline tests over in-memory store fakes: rule decisions, cache
//! promotion between layers, and endpoint selection with role fallback.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use llmproxy_core::balancer::LoadBalancer;
use llmproxy_core::cache::cache_key;
use llmproxy_core::endpoints::EndpointStore;
use llmproxy_core::health::{HealthCheckSettings, HealthChecker};
use llmproxy_core::models::{
    CacheEntry, ChatMessage, Endpoint, LoadBalanceStrategy, MessagesRequest, Model, Provider,
    RoutingConfig, RoutingModel, RoutingRule, TaskType,
};
use llmproxy_core::router::LlmRouter;
use llmproxy_core::selector::EndpointSelector;
use llmproxy_core::stores::{
    BalancerConfigStore, EndpointCatalog, RouteCacheStore, RoutingConfigStore, RoutingRuleStore,
    StoreError,
};
use llmproxy_core::ProxyError;

// ---------------------------------------------------------------------------
// Store fakes
// ---------------------------------------------------------------------------

struct FakeConfigStore {
    config: Mutex<RoutingConfig>,
    models: Vec<RoutingModel>,
}

impl FakeConfigStore {
    fn new(config: RoutingConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            models: Vec::new(),
        })
    }
}

#[async_trait]
impl RoutingConfigStore for FakeConfigStore {
    async fn load(&self) -> Result<RoutingConfig, StoreError> {
        Ok(self.config.lock().unwrap().clone())
    }

    async fn routing_model(&self, id: i64) -> Result<Option<RoutingModel>, StoreError> {
        Ok(self.models.iter().find(|m| m.id == id).cloned())
    }
}

#[derive(Default)]
struct FakeRuleStore {
    rules: Vec<RoutingRule>,
    hits: Mutex<HashMap<i64, i64>>,
}

#[async_trait]
impl RoutingRuleStore for FakeRuleStore {
    async fn list_rules(&self) -> Result<Vec<RoutingRule>, StoreError> {
        Ok(self.rules.clone())
    }

    async fn increment_hit(&self, rule_id: i64) -> Result<(), StoreError> {
        *self.hits.lock().unwrap().entry(rule_id).or_default() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl RouteCacheStore for FakeCacheStore {
    async fn get_exact(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn insert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.content_hash.clone(), entry.clone());
        Ok(())
    }

    async fn increment_hit(&self, key: &str) -> Result<(), StoreError> {
        *self.hits.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn best_semantic_match(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<(CacheEntry, f32)>, StoreError> {
        let entries = self.entries.lock().unwrap();
        let mut best: Option<(CacheEntry, f32)> = None;
        for entry in entries.values() {
            if let Some(vector) = &entry.embedding {
                let similarity = llmproxy_core::cosine_similarity(vector, embedding);
                if similarity >= threshold
                    && best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true)
                {
                    best = Some((entry.clone(), similarity));
                }
            }
        }
        Ok(best)
    }
}

struct FixedStrategy(LoadBalanceStrategy);

#[async_trait]
impl BalancerConfigStore for FixedStrategy {
    async fn strategy(&self) -> Result<LoadBalanceStrategy, StoreError> {
        Ok(self.0)
    }
}

struct FakeCatalog(Vec<Endpoint>);

#[async_trait]
impl EndpointCatalog for FakeCatalog {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn model(id: i64, name: &str, role: TaskType, weight: i64) -> Model {
    Model {
        id,
        name: name.to_string(),
        role,
        cost_per_mtok_input: 1.0,
        cost_per_mtok_output: 5.0,
        billing_multiplier: 1.0,
        weight,
        enabled: true,
    }
}

fn provider(id: i64, name: &str) -> Provider {
    Provider {
        id,
        name: name.to_string(),
        base_url: format!("https://{name}.example"),
        api_key: "k".to_string(),
        weight: 1,
        max_concurrency: 8,
        custom_headers: HashMap::new(),
        enabled: true,
    }
}

fn user_request(model_name: &str, text: &str) -> MessagesRequest {
    MessagesRequest {
        model: model_name.to_string(),
        messages: vec![ChatMessage::user(text)],
        ..Default::default()
    }
}

async fn router_with(
    config: RoutingConfig,
    cache: Arc<FakeCacheStore>,
) -> (Arc<LlmRouter>, Arc<FakeRuleStore>) {
    let rules = Arc::new(FakeRuleStore::default());
    let router = LlmRouter::new(FakeConfigStore::new(config), rules.clone(), cache).await;
    (router, rules)
}

// ---------------------------------------------------------------------------
// Rule-based decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rule_match_routes_complex_and_is_repeatable() {
    let (router, rules) = router_with(
        RoutingConfig::default(),
        Arc::new(FakeCacheStore::default()),
    )
    .await;
    let req = user_request("auto", "帮我设计一个微服务架构");

    let first = router.infer_task_type(&req).await;
    assert_eq!(first.task_type, TaskType::Complex);
    let decision = first.decision.expect("rule decisions carry a trace");
    assert_eq!(decision.cache_type, "rule");
    assert!(decision.reason.contains("matched rule"));
    assert!(!decision.from_cache);
    let winner = first.rule_match.unwrap().matched.unwrap();

    // Second invocation: identical outcome, no state required.
    let second = router.infer_task_type(&req).await;
    assert_eq!(second.task_type, TaskType::Complex);
    assert_eq!(second.decision.unwrap().cache_type, "rule");
    assert_eq!(second.rule_match.unwrap().matched.unwrap().rule_id, winner.rule_id);

    // Hit counts are incremented asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*rules.hits.lock().unwrap().get(&winner.rule_id).unwrap(), 2);
}

#[tokio::test]
async fn empty_message_defaults_without_decision() {
    let (router, _) = router_with(
        RoutingConfig::default(),
        Arc::new(FakeCacheStore::default()),
    )
    .await;

    let req = user_request("auto", "");
    let inferred = router.infer_task_type(&req).await;
    assert_eq!(inferred.task_type, TaskType::Default);
    assert!(inferred.decision.is_none());
}

#[tokio::test]
async fn injected_tags_are_invisible_to_rules() {
    let (router, _) = router_with(
        RoutingConfig::default(),
        Arc::new(FakeCacheStore::default()),
    )
    .await;

    // Only injected content: the message counts as empty.
    let req = user_request("auto", "<system-reminder>internal note</system-reminder>");
    let inferred = router.infer_task_type(&req).await;
    assert!(inferred.decision.is_none());
}

#[tokio::test]
async fn no_rule_match_falls_back_to_default_strategy() {
    let (router, _) = router_with(
        RoutingConfig::default(),
        Arc::new(FakeCacheStore::default()),
    )
    .await;

    let req = user_request("auto", "an unremarkable medium length sentence");
    let inferred = router.infer_task_type(&req).await;
    assert_eq!(inferred.task_type, TaskType::Default);
    let decision = inferred.decision.unwrap();
    assert!(decision.reason.contains("no rule matched"));
}

#[tokio::test]
async fn user_fallback_strategy_returns_configured_role() {
    let config = RoutingConfig {
        fallback_strategy: llmproxy_core::FallbackStrategy::User,
        fallback_task_type: TaskType::Complex,
        ..Default::default()
    };
    let (router, _) = router_with(config, Arc::new(FakeCacheStore::default())).await;

    let req = user_request("auto", "an unremarkable medium length sentence");
    let inferred = router.infer_task_type(&req).await;
    assert_eq!(inferred.task_type, TaskType::Complex);
}

// ---------------------------------------------------------------------------
// Cache layer promotion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn l2_hit_promotes_into_l1() {
    let message = "Unique test for L1 promotion";
    let key = cache_key(message);

    let cache = Arc::new(FakeCacheStore::default());
    cache
        .entries
        .lock()
        .unwrap()
        .insert(
            key.clone(),
            CacheEntry {
                content_hash: key.clone(),
                content_preview: message.to_lowercase(),
                embedding: None,
                task_type: TaskType::Complex,
                reason: "seeded".to_string(),
                created_at: chrono::Utc::now(),
                hit_count: 0,
            },
        );

    let config = RoutingConfig {
        rule_based_enabled: false,
        llm_enabled: true,
        ..Default::default()
    };
    let (router, _) = router_with(config, cache.clone()).await;
    let req = user_request("auto", message);

    let first = router.infer_task_type(&req).await;
    assert_eq!(first.task_type, TaskType::Complex);
    let decision = first.decision.unwrap();
    assert!(decision.from_cache);
    assert_eq!(decision.cache_type, "L2");

    let second = router.infer_task_type(&req).await;
    let decision = second.decision.unwrap();
    assert!(decision.from_cache);
    assert_eq!(decision.cache_type, "L1");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*cache.hits.lock().unwrap().get(&key).unwrap(), 1);
}

#[tokio::test]
async fn llm_disabled_reports_fallback_reason() {
    let config = RoutingConfig {
        rule_based_enabled: false,
        llm_enabled: false,
        ..Default::default()
    };
    let (router, _) = router_with(config, Arc::new(FakeCacheStore::default())).await;

    let inferred = router.infer_task_type(&user_request("auto", "hello there")).await;
    assert_eq!(inferred.task_type, TaskType::Default);
    assert!(inferred
        .decision
        .unwrap()
        .reason
        .contains("LLM routing disabled"));
}

// ---------------------------------------------------------------------------
// Endpoint selection
// ---------------------------------------------------------------------------

struct SelectorHarness {
    selector: EndpointSelector,
    health: Arc<HealthChecker>,
}

async fn selector_with(endpoints: Vec<Endpoint>, config: RoutingConfig) -> SelectorHarness {
    let store = Arc::new(EndpointStore::new(Arc::new(FakeCatalog(endpoints))));
    let health = HealthChecker::new(HealthCheckSettings {
        enabled: false,
        interval_seconds: 30,
        timeout_seconds: 1,
    });
    store.set_health_checker(health.clone());
    store.reload().await.unwrap();

    let balancer = Arc::new(LoadBalancer::new(Arc::new(FixedStrategy(
        LoadBalanceStrategy::Weighted,
    ))));
    let config_store = FakeConfigStore::new(config);
    let (router, _) = router_with(RoutingConfig::default(), Arc::new(FakeCacheStore::default()))
        .await;

    SelectorHarness {
        selector: EndpointSelector::new(store, health.clone(), balancer, router, config_store),
        health,
    }
}

fn catalog() -> Vec<Endpoint> {
    vec![
        Endpoint {
            provider: provider(1, "alpha"),
            model: model(1, "claude-haiku", TaskType::Simple, 10),
        },
        Endpoint {
            provider: provider(1, "alpha"),
            model: model(2, "claude-sonnet", TaskType::Default, 10),
        },
        Endpoint {
            provider: provider(2, "beta"),
            model: model(2, "claude-sonnet", TaskType::Default, 10),
        },
        Endpoint {
            provider: provider(1, "alpha"),
            model: model(3, "claude-opus", TaskType::Complex, 10),
        },
    ]
}

#[tokio::test]
async fn named_model_selects_directly() {
    let harness = selector_with(catalog(), RoutingConfig::default()).await;
    let result = harness
        .selector
        .select(&user_request("claude-opus", "prove this theorem"))
        .await
        .unwrap();
    assert_eq!(result.model.name, "claude-opus");
    assert!(result.fallback_from.is_none());
    assert!(result.decision.is_none(), "explicit model skips routing");
}

#[tokio::test]
async fn unknown_model_is_an_error_not_a_substitution() {
    let harness = selector_with(catalog(), RoutingConfig::default()).await;
    let err = harness
        .selector
        .select(&user_request("gpt-9000", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::UnknownModel { .. }));
}

#[tokio::test]
async fn auto_routes_via_smart_routing() {
    let harness = selector_with(catalog(), RoutingConfig::default()).await;
    let result = harness
        .selector
        .select(&user_request("AUTO", "帮我设计一个微服务架构"))
        .await
        .unwrap();
    assert_eq!(result.task_type, Some(TaskType::Complex));
    assert_eq!(result.model.name, "claude-opus");
    assert_eq!(result.decision.unwrap().cache_type, "rule");
    assert!(result.rule_match.is_some());
}

#[tokio::test]
async fn missing_model_falls_back_from_default_role() {
    let harness = selector_with(catalog(), RoutingConfig::default()).await;
    let result = harness
        .selector
        .select(&user_request("", "whatever"))
        .await
        .unwrap();
    assert_eq!(result.model.name, "claude-sonnet");
}

#[tokio::test]
async fn unhealthy_named_model_falls_back_within_role() {
    let harness = selector_with(catalog(), RoutingConfig::default()).await;

    // Knock out both sonnet endpoints; the default role falls through to
    // complex per the role chain.
    harness.health.update_endpoints(&[
        Endpoint {
            provider: provider(1, "alpha"),
            model: model(3, "claude-opus", TaskType::Complex, 10),
        },
        Endpoint {
            provider: provider(1, "alpha"),
            model: model(1, "claude-haiku", TaskType::Simple, 10),
        },
    ]);

    let result = harness
        .selector
        .select(&user_request("claude-sonnet", "hello"))
        .await
        .unwrap();
    assert_eq!(result.model.name, "claude-opus");
    assert_eq!(result.fallback_from.as_deref(), Some("model claude-sonnet"));
}

#[tokio::test]
async fn force_smart_routing_overrides_named_model() {
    let config = RoutingConfig {
        force_smart_routing: true,
        ..Default::default()
    };
    let harness = selector_with(catalog(), config).await;
    let result = harness
        .selector
        .select(&user_request("claude-haiku", "帮我设计一个微服务架构"))
        .await
        .unwrap();
    // Smart routing decided complex even though a simple model was named.
    assert_eq!(result.model.name, "claude-opus");
    assert_eq!(result.task_type, Some(TaskType::Complex));
}

#[tokio::test]
async fn role_with_no_healthy_models_errors() {
    let harness = selector_with(Vec::new(), RoutingConfig::default()).await;
    let err = harness
        .selector
        .select(&user_request("", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NoHealthyEndpoint { .. }));
}
