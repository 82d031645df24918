//! # Load Balancer
//!
//! Picks one endpoint out of the healthy candidates for a model. The
//! strategy tag lives in durable config and is re-read at most every five
//! seconds; between reads the cached value is used so the balancer never
//! adds a store round-trip to the hot path.
//!
//! Strategies:
//!
//! - `weighted` (default): cumulative provider-weight selection; a
//!   zero-or-negative total degrades to uniform random.
//! - `round_robin`: a monotonic counter per model name, so each model
//!   cycles over its providers independently.
//! - `conversation_hash`: SHA-256 of role + first 200 chars of the first
//!   message, so one conversation sticks to one endpoint.
//! - `least_connections`: uniform random until live connection counts are
//!   consulted.

use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::models::{Endpoint, LoadBalanceStrategy, MessagesRequest};
use crate::stores::BalancerConfigStore;

const STRATEGY_CACHE_TTL: Duration = Duration::from_secs(5);

/// Endpoint selection across providers serving the same model.
pub struct LoadBalancer {
    config: Arc<dyn BalancerConfigStore>,
    cached: Mutex<Option<(LoadBalanceStrategy, Instant)>>,
    /// Round-robin counters keyed by model name
    counters: DashMap<String, AtomicU64>,
}

impl LoadBalancer {
    pub fn new(config: Arc<dyn BalancerConfigStore>) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
            counters: DashMap::new(),
        }
    }

    /// Select one endpoint. Returns `None` for an empty candidate list and
    /// short-circuits a single candidate.
    pub async fn select(&self, endpoints: &[Endpoint], req: &MessagesRequest) -> Option<Endpoint> {
        if endpoints.is_empty() {
            return None;
        }
        if endpoints.len() == 1 {
            return Some(endpoints[0].clone());
        }

        let strategy = self.current_strategy().await;
        let chosen = match strategy {
            LoadBalanceStrategy::Weighted => self.select_weighted(endpoints),
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(endpoints),
            LoadBalanceStrategy::ConversationHash => self.select_conversation_hash(endpoints, req),
            // Placeholder until live connection counts are consulted.
            LoadBalanceStrategy::LeastConnections => self.select_random(endpoints),
        };
        Some(chosen)
    }

    async fn current_strategy(&self) -> LoadBalanceStrategy {
        {
            let cached = self.cached.lock().unwrap();
            if let Some((strategy, at)) = *cached {
                if at.elapsed() < STRATEGY_CACHE_TTL {
                    return strategy;
                }
            }
        }

        let strategy = match self.config.strategy().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to load balance strategy, using weighted");
                LoadBalanceStrategy::Weighted
            }
        };
        *self.cached.lock().unwrap() = Some((strategy, Instant::now()));
        strategy
    }

    fn select_weighted(&self, endpoints: &[Endpoint]) -> Endpoint {
        let total: i64 = endpoints.iter().map(|e| e.provider.weight.max(0)).sum();
        if total <= 0 {
            return self.select_random(endpoints);
        }

        let mut roll = rand::thread_rng().gen_range(0..total);
        for endpoint in endpoints {
            let weight = endpoint.provider.weight.max(0);
            if roll < weight {
                return endpoint.clone();
            }
            roll -= weight;
        }
        endpoints[endpoints.len() - 1].clone()
    }

    fn select_round_robin(&self, endpoints: &[Endpoint]) -> Endpoint {
        let key = endpoints[0].model.name.clone();
        let counter = self.counters.entry(key).or_insert_with(|| AtomicU64::new(0));
        let n = counter.fetch_add(1, Ordering::Relaxed);
        endpoints[(n % endpoints.len() as u64) as usize].clone()
    }

    fn select_conversation_hash(&self, endpoints: &[Endpoint], req: &MessagesRequest) -> Endpoint {
        let first = req.messages.first();
        let role = first.map(|m| m.role.as_str()).unwrap_or("");
        let text: String = first
            .map(|m| m.content.text())
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(role.as_bytes());
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();

        let mut top = [0u8; 8];
        top.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(top) % endpoints.len() as u64;
        endpoints[index as usize].clone()
    }

    fn select_random(&self, endpoints: &[Endpoint]) -> Endpoint {
        let index = rand::thread_rng().gen_range(0..endpoints.len());
        endpoints[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, Model, Provider, TaskType};
    use crate::stores::StoreError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedStrategy(LoadBalanceStrategy);

    #[async_trait]
    impl BalancerConfigStore for FixedStrategy {
        async fn strategy(&self) -> Result<LoadBalanceStrategy, StoreError> {
            Ok(self.0)
        }
    }

    struct FailingStrategy;

    #[async_trait]
    impl BalancerConfigStore for FailingStrategy {
        async fn strategy(&self) -> Result<LoadBalanceStrategy, StoreError> {
            Err(StoreError::new("boom"))
        }
    }

    fn endpoint(provider_name: &str, weight: i64) -> Endpoint {
        Endpoint {
            provider: Provider {
                id: 0,
                name: provider_name.to_string(),
                base_url: format!("https://{provider_name}.example"),
                api_key: "k".to_string(),
                weight,
                max_concurrency: 8,
                custom_headers: HashMap::new(),
                enabled: true,
            },
            model: Model {
                id: 0,
                name: "claude-sonnet-4".to_string(),
                role: TaskType::Default,
                cost_per_mtok_input: 0.0,
                cost_per_mtok_output: 0.0,
                billing_multiplier: 1.0,
                weight: 1,
                enabled: true,
            },
        }
    }

    fn balancer(strategy: LoadBalanceStrategy) -> LoadBalancer {
        LoadBalancer::new(Arc::new(FixedStrategy(strategy)))
    }

    fn request(first_message: &str) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![ChatMessage::user(first_message)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_input_yields_none() {
        let lb = balancer(LoadBalanceStrategy::Weighted);
        assert!(lb.select(&[], &request("x")).await.is_none());
    }

    #[tokio::test]
    async fn single_endpoint_short_circuits() {
        let lb = balancer(LoadBalanceStrategy::RoundRobin);
        let only = [endpoint("solo", 1)];
        for _ in 0..5 {
            let chosen = lb.select(&only, &request("x")).await.unwrap();
            assert_eq!(chosen.provider.name, "solo");
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_evenly() {
        let lb = balancer(LoadBalanceStrategy::RoundRobin);
        let eps = [endpoint("a", 1), endpoint("b", 1), endpoint("c", 1)];

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let chosen = lb.select(&eps, &request("x")).await.unwrap();
            *counts.entry(chosen.provider.name).or_default() += 1;
        }
        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 10);
        assert_eq!(counts["c"], 10);
    }

    #[tokio::test]
    async fn conversation_hash_is_sticky() {
        let lb = balancer(LoadBalanceStrategy::ConversationHash);
        let eps = [endpoint("a", 1), endpoint("b", 1), endpoint("c", 1)];

        let req = request("please review this pull request");
        let first = lb.select(&eps, &req).await.unwrap().provider.name;
        for _ in 0..20 {
            let again = lb.select(&eps, &req).await.unwrap().provider.name;
            assert_eq!(again, first);
        }

        // A later turn keeps the same first message, so the pin holds.
        let mut longer = request("please review this pull request");
        longer.messages.push(ChatMessage::assistant("sure"));
        longer.messages.push(ChatMessage::user("and the tests?"));
        assert_eq!(lb.select(&eps, &longer).await.unwrap().provider.name, first);
    }

    #[tokio::test]
    async fn weighted_respects_weights() {
        let lb = balancer(LoadBalanceStrategy::Weighted);
        let eps = [endpoint("heavy", 9), endpoint("light", 1)];

        let mut heavy = 0;
        for _ in 0..400 {
            if lb.select(&eps, &request("x")).await.unwrap().provider.name == "heavy" {
                heavy += 1;
            }
        }
        // ~90% expected; allow a generous band.
        assert!(heavy > 280, "heavy got {heavy}/400");
    }

    #[tokio::test]
    async fn weighted_with_zero_total_degrades_to_random() {
        let lb = balancer(LoadBalanceStrategy::Weighted);
        let eps = [endpoint("a", 0), endpoint("b", -3)];
        let chosen = lb.select(&eps, &request("x")).await.unwrap();
        assert!(chosen.provider.name == "a" || chosen.provider.name == "b");
    }

    #[tokio::test]
    async fn strategy_load_failure_degrades_to_weighted() {
        let lb = LoadBalancer::new(Arc::new(FailingStrategy));
        let eps = [endpoint("a", 1), endpoint("b", 1)];
        assert!(lb.select(&eps, &request("x")).await.is_some());
    }
}
