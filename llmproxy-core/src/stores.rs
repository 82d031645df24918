//! # Store Contracts
//!
//! Capability traits the engine consumes. The gateway implements them over
//! SQLite; tests implement them with in-memory fakes. The engine never
//! touches SQL directly, and store failures on the request path degrade
//! (cache miss, builtin-only rules, default config) rather than fail the
//! client request.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    CacheEntry, Endpoint, LoadBalanceStrategy, RequestLogEntry, RoutingConfig, RoutingModel,
    RoutingRule,
};

/// Durable-store failure, stringly typed on purpose: the engine only ever
/// logs these and degrades.
#[derive(Error, Debug)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Routing-rule persistence.
#[async_trait]
pub trait RoutingRuleStore: Send + Sync {
    /// Custom rules to merge over the builtins. Disabled rules may be
    /// included; the classifier filters them.
    async fn list_rules(&self) -> Result<Vec<RoutingRule>, StoreError>;

    /// Bump a rule's hit counter. Eventually consistent; callers fire and
    /// forget.
    async fn increment_hit(&self, rule_id: i64) -> Result<(), StoreError>;
}

/// Singleton routing configuration plus router/embedding model rows.
#[async_trait]
pub trait RoutingConfigStore: Send + Sync {
    async fn load(&self) -> Result<RoutingConfig, StoreError>;

    async fn routing_model(&self, id: i64) -> Result<Option<RoutingModel>, StoreError>;
}

/// Durable routing-cache layers (L2 exact, L3 semantic).
#[async_trait]
pub trait RouteCacheStore: Send + Sync {
    /// Exact lookup by content hash. Expired entries are treated as absent.
    async fn get_exact(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or refresh an entry.
    async fn insert(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Bump an entry's hit counter.
    async fn increment_hit(&self, key: &str) -> Result<(), StoreError>;

    /// Best embedded entry at or above the similarity threshold, together
    /// with its similarity. Entries without embeddings never match.
    async fn best_semantic_match(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<(CacheEntry, f32)>, StoreError>;
}

/// Load-balancer configuration.
#[async_trait]
pub trait BalancerConfigStore: Send + Sync {
    async fn strategy(&self) -> Result<LoadBalanceStrategy, StoreError>;
}

/// Source of the (provider, model) catalog for endpoint-store reloads.
#[async_trait]
pub trait EndpointCatalog: Send + Sync {
    /// All currently reachable endpoints: enabled models crossed with the
    /// enabled providers serving them.
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;
}

/// Request-log persistence used by the async sink.
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    /// Insert a batch, preserving slice order.
    async fn insert_batch(&self, entries: &[RequestLogEntry]) -> Result<(), StoreError>;
}
