//! # Server Wiring
//!
//! Builds the axum application and the process-wide singletons: database
//! pools, endpoint store, health checker, routing pipeline, upstream proxy,
//! request-log sink and worker coordinator. All background loops hang off
//! one cancellation token so shutdown is a single cancel plus drain.
//!
//! The store/checker cycle is broken here: both are constructed first, then
//! the checker is injected into the store before the initial reload.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use llmproxy_core::balancer::LoadBalancer;
use llmproxy_core::endpoints::EndpointStore;
use llmproxy_core::health::HealthChecker;
use llmproxy_core::proxy::UpstreamProxy;
use llmproxy_core::router::LlmRouter;
use llmproxy_core::selector::EndpointSelector;
use llmproxy_core::stores::RoutingConfigStore;

use crate::config::Config;
use crate::db::{
    Database, SqliteApiKeyStore, SqliteBalancerConfigStore, SqliteEndpointCatalog,
    SqliteRequestLogStore, SqliteRouteCacheStore, SqliteRoutingConfigStore,
    SqliteRoutingRuleStore, SqliteWorkerStore,
};
use crate::handlers;
use crate::request_log::RequestLogSink;
use crate::worker::WorkerCoordinator;

/// Shared state for all handlers. Everything is `Arc`-shared; cloning the
/// state clones pointers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub endpoints: Arc<EndpointStore>,
    pub health: Arc<HealthChecker>,
    pub selector: Arc<EndpointSelector>,
    pub proxy: Arc<UpstreamProxy>,
    pub sink: Arc<RequestLogSink>,
    pub api_keys: Arc<SqliteApiKeyStore>,
    pub routing_config: Arc<dyn RoutingConfigStore>,
    pub coordinator: Arc<WorkerCoordinator>,
    /// Cancels every background loop on shutdown
    pub cancel: CancellationToken,
}

/// Build the application: open the database, wire the engine, spawn the
/// background loops, and return the router plus the state handle the
/// binary needs for shutdown.
pub async fn create_server(config: Config) -> anyhow::Result<(Router, AppState)> {
    let cancel = CancellationToken::new();
    let db = Database::open(&config.database).await?;

    // Store wrappers over the shared database.
    let rule_store = Arc::new(SqliteRoutingRuleStore::new(db.clone()));
    let routing_config: Arc<dyn RoutingConfigStore> =
        Arc::new(SqliteRoutingConfigStore::new(db.clone()));
    let cache_store = Arc::new(SqliteRouteCacheStore::new(db.clone()));
    let balancer_config = Arc::new(SqliteBalancerConfigStore::new(db.clone()));
    let catalog = Arc::new(SqliteEndpointCatalog::new(db.clone()));
    let api_keys = Arc::new(SqliteApiKeyStore::new(db.clone()));
    let log_store = Arc::new(SqliteRequestLogStore::new(db.clone()));
    let worker_store = Arc::new(SqliteWorkerStore::new(db.clone()));

    // Health checker and endpoint store reference each other; construct
    // both, inject, then load the first snapshot.
    let health = HealthChecker::new(db.health_settings().await);
    let endpoints = Arc::new(EndpointStore::new(catalog));
    endpoints.set_health_checker(health.clone());
    if let Err(e) = endpoints.reload().await {
        warn!(error = %e, "initial endpoint reload failed, starting with an empty snapshot");
    }
    tokio::spawn(health.clone().run(cancel.clone()));
    health.check_now().await;

    // Routing pipeline and upstream proxy.
    let router = LlmRouter::new(routing_config.clone(), rule_store, cache_store).await;
    let balancer = Arc::new(LoadBalancer::new(balancer_config));
    let selector = Arc::new(EndpointSelector::new(
        endpoints.clone(),
        health.clone(),
        balancer.clone(),
        router,
        routing_config.clone(),
    ));
    let proxy = Arc::new(UpstreamProxy::new(health.clone(), balancer)?);

    // Async request logging.
    let sink = RequestLogSink::start(log_store);

    // Worker coordination: register, elect, heartbeat, singleton jobs.
    let coordinator = WorkerCoordinator::new(worker_store);
    coordinator.start().await.map_err(|e| anyhow::anyhow!(e))?;
    coordinator.spawn_heartbeat(cancel.clone());
    coordinator.spawn_singleton_jobs(cancel.clone());

    let state = AppState {
        config: Arc::new(config),
        db,
        endpoints,
        health,
        selector,
        proxy,
        sink,
        api_keys,
        routing_config,
        coordinator,
        cancel,
    };

    let app = Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route("/api/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    Ok((app, state))
}

impl AppState {
    /// Graceful teardown: stop background loops, drain the log sink, drop
    /// this worker's registration.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.sink.shutdown().await;
        self.coordinator.shutdown().await;
    }
}
