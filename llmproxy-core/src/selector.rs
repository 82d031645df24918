//! # Endpoint Selector
//!
//! Turns a request plus the current endpoint snapshot into one concrete
//! healthy endpoint. Priority order:
//!
//! 1. `force_smart_routing` in config sends everything through smart routing.
//! 2. Model `"auto"` (any case) does the same.
//! 3. A configured, enabled model is used directly when it has a healthy
//!    endpoint; otherwise the selector falls back within the model's role.
//! 4. A disabled or unconfigured model is an error. Nothing is silently
//!    substituted for an explicit model name.
//! 5. No model at all falls back from the `default` role.
//!
//! Within a role the enabled model with the highest positive weight wins;
//! when every weight is non-positive the first model in catalog order wins.
//! The load balancer then picks among that model's healthy endpoints.

use std::sync::Arc;
use tracing::debug;

use crate::balancer::LoadBalancer;
use crate::endpoints::EndpointStore;
use crate::error::ProxyError;
use crate::health::HealthChecker;
use crate::models::{
    Endpoint, EndpointSelectionResult, MessagesRequest, RoutingConfig, TaskType,
};
use crate::router::LlmRouter;
use crate::stores::RoutingConfigStore;

pub struct EndpointSelector {
    endpoints: Arc<EndpointStore>,
    health: Arc<HealthChecker>,
    balancer: Arc<LoadBalancer>,
    router: Arc<LlmRouter>,
    config_store: Arc<dyn RoutingConfigStore>,
}

impl EndpointSelector {
    pub fn new(
        endpoints: Arc<EndpointStore>,
        health: Arc<HealthChecker>,
        balancer: Arc<LoadBalancer>,
        router: Arc<LlmRouter>,
        config_store: Arc<dyn RoutingConfigStore>,
    ) -> Self {
        Self {
            endpoints,
            health,
            balancer,
            router,
            config_store,
        }
    }

    /// Select the endpoint that should serve this request, using the
    /// store's current snapshot.
    pub async fn select(
        &self,
        req: &MessagesRequest,
    ) -> Result<EndpointSelectionResult, ProxyError> {
        let snapshot = self.endpoints.snapshot();
        self.select_with_snapshot(req, &snapshot).await
    }

    /// Select against a caller-held snapshot. A request that also needs the
    /// snapshot for failover alternatives passes the same one here, so the
    /// whole request observes a single consistent endpoint set.
    pub async fn select_with_snapshot(
        &self,
        req: &MessagesRequest,
        snapshot: &[Endpoint],
    ) -> Result<EndpointSelectionResult, ProxyError> {
        let config = self
            .config_store
            .load()
            .await
            .unwrap_or_else(|_| RoutingConfig::default());

        let requested = req.model.trim();
        let wants_auto = requested.eq_ignore_ascii_case("auto");

        if config.force_smart_routing || wants_auto {
            return self.select_smart(req, snapshot).await;
        }

        if !requested.is_empty() {
            let named: Vec<Endpoint> = snapshot
                .iter()
                .filter(|e| e.model.name == requested && e.model.enabled)
                .cloned()
                .collect();
            if named.is_empty() {
                return Err(ProxyError::UnknownModel {
                    model: requested.to_string(),
                });
            }

            let healthy = self.healthy(&named);
            if !healthy.is_empty() {
                let endpoint = self
                    .balancer
                    .select(&healthy, req)
                    .await
                    .expect("non-empty candidate list");
                return Ok(EndpointSelectionResult {
                    model: endpoint.model.clone(),
                    endpoint,
                    task_type: None,
                    decision: None,
                    rule_match: None,
                    fallback_from: None,
                });
            }

            // The named model is down; stay within its role.
            let role = named[0].model.role;
            debug!(model = requested, role = %role, "requested model unhealthy, role fallback");
            let mut result = self.select_for_role(role, req, snapshot).await?;
            result.fallback_from = Some(format!("model {requested}"));
            return Ok(result);
        }

        self.select_for_role(TaskType::Default, req, snapshot).await
    }

    async fn select_smart(
        &self,
        req: &MessagesRequest,
        snapshot: &[Endpoint],
    ) -> Result<EndpointSelectionResult, ProxyError> {
        let inferred = self.router.infer_task_type(req).await;
        let mut result = self
            .select_for_role(inferred.task_type, req, snapshot)
            .await?;
        result.task_type = Some(inferred.task_type);
        result.decision = inferred.decision;
        result.rule_match = inferred.rule_match;
        Ok(result)
    }

    /// Walk the role's fallback chain; the first role with a healthy model
    /// yields the result.
    async fn select_for_role(
        &self,
        role: TaskType,
        req: &MessagesRequest,
        snapshot: &[Endpoint],
    ) -> Result<EndpointSelectionResult, ProxyError> {
        for (i, candidate_role) in role.fallback_chain().iter().enumerate() {
            let Some((model_name, healthy)) = self.pick_model(*candidate_role, snapshot) else {
                continue;
            };
            let endpoint = self
                .balancer
                .select(&healthy, req)
                .await
                .expect("non-empty candidate list");
            debug!(model = %model_name, role = %candidate_role, "role selection");
            return Ok(EndpointSelectionResult {
                model: endpoint.model.clone(),
                endpoint,
                task_type: None,
                decision: None,
                rule_match: None,
                fallback_from: (i > 0).then(|| format!("role {role}")),
            });
        }

        Err(ProxyError::NoHealthyEndpoint {
            model: format!("role {role}"),
        })
    }

    /// The winning model for a role and its healthy endpoints: highest
    /// positive weight wins; all-non-positive weights fall back to catalog
    /// order.
    fn pick_model(
        &self,
        role: TaskType,
        snapshot: &[Endpoint],
    ) -> Option<(String, Vec<Endpoint>)> {
        let mut models: Vec<(String, i64)> = Vec::new();
        for endpoint in snapshot {
            if endpoint.model.role == role && endpoint.model.enabled {
                if !models.iter().any(|(name, _)| name == &endpoint.model.name) {
                    models.push((endpoint.model.name.clone(), endpoint.model.weight));
                }
            }
        }

        let mut ordered: Vec<&(String, i64)> = models.iter().filter(|(_, w)| *w > 0).collect();
        ordered.sort_by_key(|(_, w)| std::cmp::Reverse(*w));
        // Append the non-positive-weight models in catalog order as a last
        // resort tier.
        let rest: Vec<&(String, i64)> = models.iter().filter(|(_, w)| *w <= 0).collect();

        for (name, _) in ordered.into_iter().chain(rest) {
            let healthy = self.healthy(
                &snapshot
                    .iter()
                    .filter(|e| &e.model.name == name)
                    .cloned()
                    .collect::<Vec<_>>(),
            );
            if !healthy.is_empty() {
                return Some((name.clone(), healthy));
            }
        }
        None
    }

    fn healthy(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        endpoints
            .iter()
            .filter(|e| self.health.is_healthy(&e.name()))
            .cloned()
            .collect()
    }
}
