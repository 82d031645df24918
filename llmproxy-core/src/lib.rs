//! # llmproxy-core
//!
//! The request-path engine of the LLM smart proxy. Clients address an
//! abstract model; this crate decides which concrete upstream
//! (provider, model) pair serves the request, forwards it, and accounts for
//! the outcome.
//!
//! ## Subsystems
//!
//! - **Routing pipeline** ([`router`], [`rules`], [`dsl`], [`cache`]):
//!   rule engine with a condition expression language, a three-layer
//!   routing cache (in-process exact, durable exact, durable semantic), and
//!   an optional LLM-based classifier with fallback policies.
//! - **Endpoint selection** ([`selector`], [`balancer`], [`endpoints`]):
//!   role-based model choice with cross-role fallback, then load balancing
//!   across healthy providers over an atomically swapped endpoint snapshot.
//! - **Health tracking** ([`health`]): active probing and per-endpoint
//!   counters with copy-safe snapshots.
//! - **Upstream proxy** ([`proxy`]): non-streaming and SSE forwarding with
//!   per-attempt retry across endpoints and token/cost accounting.
//!
//! Durable state is reached exclusively through the traits in [`stores`];
//! the server crate provides SQLite implementations. Routing failures never
//! fail a client request: the pipeline degrades to the default role and the
//! proxy carries on.

pub mod balancer;
pub mod cache;
pub mod dsl;
pub mod endpoints;
pub mod error;
pub mod health;
pub mod models;
pub mod proxy;
pub mod router;
pub mod rules;
pub mod selector;
pub mod stores;

pub use balancer::LoadBalancer;
pub use cache::{cache_key, cosine_similarity, normalize_content, RouteCache};
pub use endpoints::EndpointStore;
pub use error::{is_retryable_status, ProxyError, UpstreamError};
pub use health::{ConnectionGuard, HealthCheckSettings, HealthChecker};
pub use models::{
    compute_cost, CacheEntry, ChatMessage, ClassifyResult, Endpoint, EndpointSelectionResult,
    EndpointState, EndpointStatus, FallbackStrategy, LoadBalanceStrategy, MessageContent,
    MessagesRequest, MessagesResponse, Model, Provider, ProxyMetadata, RequestLogEntry,
    RoutingConfig, RoutingDecision, RoutingModel, RoutingRule, RuleHit, StreamChunk, TaskType,
    Usage, WorkerRegistration,
};
pub use proxy::{UpstreamProxy, DEFAULT_ANTHROPIC_VERSION};
pub use router::{InferredRoute, LlmRouter};
pub use rules::RuleClassifier;
pub use selector::EndpointSelector;
pub use stores::{
    BalancerConfigStore, EndpointCatalog, RequestLogStore, RouteCacheStore, RoutingConfigStore,
    RoutingRuleStore, StoreError,
};
