//! # Durable Store
//!
//! SQLite access for the gateway: pool construction and the repository
//! implementations behind the engine's store traits.
//!
//! Two pools share one database file. The small read/write pool serves the
//! request path; the larger read-only pool serves scan-heavy queries
//! (semantic cache search, stats rollups) so an analytical read can never
//! starve a request-path write. Both run in WAL mode with a 5 second busy
//! timeout.
//!
//! A fresh database is bootstrapped from `schema.sql` (idempotent
//! `CREATE TABLE IF NOT EXISTS` statements); real migration tooling is the
//! operator's concern.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use llmproxy_core::models::{
    CacheEntry, Endpoint, FallbackStrategy, LoadBalanceStrategy, Model, Provider,
    RequestLogEntry, RoutingConfig, RoutingModel, RoutingRule, TaskType, WorkerRegistration,
};
use llmproxy_core::stores::{
    BalancerConfigStore, EndpointCatalog, RequestLogStore, RouteCacheStore, RoutingConfigStore,
    RoutingRuleStore, StoreError,
};
use llmproxy_core::{cosine_similarity, HealthCheckSettings};

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("schema.sql");

/// The shared database handle: a read/write pool for the request path and a
/// read-only pool for analytical scans.
#[derive(Clone)]
pub struct Database {
    pub rw: SqlitePool,
    pub ro: SqlitePool,
}

impl Database {
    /// Open (creating if missing), bootstrap the schema, and build both
    /// pools.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let busy = Duration::from_secs(config.busy_timeout_secs.max(1));

        let base_options = || {
            SqliteConnectOptions::new()
                .filename(Path::new(&config.path))
                .busy_timeout(busy)
                .pragma("journal_mode", "WAL")
                .pragma("synchronous", "NORMAL")
                .foreign_keys(true)
        };

        let rw = SqlitePoolOptions::new()
            .max_connections(config.write_pool_size.max(1))
            .idle_timeout(Some(Duration::from_secs(600)))
            .connect_with(base_options().create_if_missing(true))
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&rw).await?;

        let ro = SqlitePoolOptions::new()
            .max_connections(config.read_pool_size.max(1))
            .connect_with(base_options().read_only(true))
            .await?;

        info!(path = %config.path, "database ready (WAL, rw + ro pools)");
        Ok(Self { rw, ro })
    }

    /// Current health-check settings from the singleton row, defaults on a
    /// missing row.
    pub async fn health_settings(&self) -> HealthCheckSettings {
        let row = sqlx::query(
            "SELECT enabled, interval_seconds, timeout_seconds FROM health_check_config WHERE id = 1",
        )
        .fetch_optional(&self.rw)
        .await;

        match row {
            Ok(Some(row)) => HealthCheckSettings {
                enabled: row.get::<bool, _>("enabled"),
                interval_seconds: row.get::<i64, _>("interval_seconds").max(1) as u64,
                timeout_seconds: row.get::<i64, _>("timeout_seconds").max(1) as u64,
            },
            Ok(None) => HealthCheckSettings::default(),
            Err(e) => {
                warn!(error = %e, "health settings unavailable, using defaults");
                HealthCheckSettings::default()
            }
        }
    }
}

fn store_err(e: sqlx::Error) -> StoreError {
    StoreError::new(e.to_string())
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Routing rules
// ---------------------------------------------------------------------------

pub struct SqliteRoutingRuleStore {
    db: Database,
}

impl SqliteRoutingRuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn rule_from_row(row: &SqliteRow) -> RoutingRule {
    let keywords: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("keywords")).unwrap_or_default();
    RoutingRule {
        id: row.get("id"),
        name: row.get("name"),
        keywords,
        pattern: row.get("pattern"),
        condition: row.get("condition"),
        task_type: TaskType::parse(&row.get::<String, _>("task_type")),
        priority: row.get("priority"),
        is_builtin: row.get("is_builtin"),
        enabled: row.get("enabled"),
        hit_count: row.get("hit_count"),
    }
}

#[async_trait]
impl RoutingRuleStore for SqliteRoutingRuleStore {
    async fn list_rules(&self) -> Result<Vec<RoutingRule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM routing_rules ORDER BY priority DESC, id ASC")
            .fetch_all(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(rule_from_row).collect())
    }

    async fn increment_hit(&self, rule_id: i64) -> Result<(), StoreError> {
        // Builtin rules live in code, not in the table; a zero-row update is
        // not an error.
        sqlx::query("UPDATE routing_rules SET hit_count = hit_count + 1 WHERE id = ?")
            .bind(rule_id)
            .execute(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing configuration
// ---------------------------------------------------------------------------

pub struct SqliteRoutingConfigStore {
    db: Database,
}

impl SqliteRoutingConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoutingConfigStore for SqliteRoutingConfigStore {
    async fn load(&self) -> Result<RoutingConfig, StoreError> {
        let row = sqlx::query("SELECT * FROM routing_llm_config WHERE id = 1")
            .fetch_optional(&self.db.rw)
            .await
            .map_err(store_err)?;

        let Some(row) = row else {
            return Ok(RoutingConfig::default());
        };
        Ok(RoutingConfig {
            rule_based_enabled: row.get("rule_based_enabled"),
            llm_enabled: row.get("llm_enabled"),
            semantic_cache_enabled: row.get("semantic_cache_enabled"),
            l1_ttl_secs: row.get::<i64, _>("l1_ttl_secs").max(1) as u64,
            l1_capacity: row.get::<i64, _>("l1_capacity").max(1) as usize,
            l2_ttl_secs: row.get::<i64, _>("l2_ttl_secs").max(1) as u64,
            l3_ttl_secs: row.get::<i64, _>("l3_ttl_secs").max(1) as u64,
            router_model_id: row.get("router_model_id"),
            fallback_model_id: row.get("fallback_model_id"),
            embedding_model_id: row.get("embedding_model_id"),
            temperature: row.get::<f64, _>("temperature") as f32,
            max_tokens: row.get::<i64, _>("max_tokens").max(1) as u32,
            retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
            similarity_threshold: row.get::<f64, _>("similarity_threshold") as f32,
            fallback_strategy: FallbackStrategy::parse(&row.get::<String, _>("fallback_strategy")),
            fallback_task_type: TaskType::parse(&row.get::<String, _>("fallback_task_type")),
            force_smart_routing: row.get("force_smart_routing"),
            log_full_content: row.get("log_full_content"),
        })
    }

    async fn routing_model(&self, id: i64) -> Result<Option<RoutingModel>, StoreError> {
        let row = sqlx::query("SELECT * FROM routing_models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(row.map(|row| RoutingModel {
            id: row.get("id"),
            name: row.get("name"),
            base_url: row.get("base_url"),
            api_key: row.get("api_key"),
            model: row.get("model"),
            enabled: row.get("enabled"),
        }))
    }
}

// ---------------------------------------------------------------------------
// Routing cache (L2 exact + L3 semantic)
// ---------------------------------------------------------------------------

pub struct SqliteRouteCacheStore {
    db: Database,
}

impl SqliteRouteCacheStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn cache_entry_from_row(row: &SqliteRow) -> CacheEntry {
    let embedding = row
        .get::<Option<String>, _>("embedding")
        .and_then(|raw| serde_json::from_str::<Vec<f32>>(&raw).ok());
    CacheEntry {
        content_hash: row.get("content_hash"),
        content_preview: row.get("content_preview"),
        embedding,
        task_type: TaskType::parse(&row.get::<String, _>("task_type")),
        reason: row.get("reason"),
        created_at: chrono::DateTime::from_timestamp(row.get::<i64, _>("created_at"), 0)
            .unwrap_or_else(chrono::Utc::now),
        hit_count: row.get("hit_count"),
    }
}

#[async_trait]
impl RouteCacheStore for SqliteRouteCacheStore {
    async fn get_exact(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM routing_embedding_cache
             WHERE content_hash = ?
               AND created_at >= strftime('%s','now')
                   - (SELECT l2_ttl_secs FROM routing_llm_config WHERE id = 1)",
        )
        .bind(key)
        .fetch_optional(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(row.as_ref().map(cache_entry_from_row))
    }

    async fn insert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let embedding = entry
            .embedding
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());
        sqlx::query(
            "INSERT INTO routing_embedding_cache
                 (content_hash, content_preview, embedding, task_type, reason, created_at, hit_count)
             VALUES (?, ?, ?, ?, ?, ?, 0)
             ON CONFLICT(content_hash) DO UPDATE SET
                 content_preview = excluded.content_preview,
                 embedding = COALESCE(excluded.embedding, routing_embedding_cache.embedding),
                 task_type = excluded.task_type,
                 reason = excluded.reason,
                 created_at = excluded.created_at",
        )
        .bind(&entry.content_hash)
        .bind(&entry.content_preview)
        .bind(embedding)
        .bind(entry.task_type.as_str())
        .bind(&entry.reason)
        .bind(entry.created_at.timestamp())
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn increment_hit(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE routing_embedding_cache SET hit_count = hit_count + 1 WHERE content_hash = ?",
        )
        .bind(key)
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn best_semantic_match(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<(CacheEntry, f32)>, StoreError> {
        // Scan over the read-only pool; similarity is computed in process.
        let rows = sqlx::query(
            "SELECT * FROM routing_embedding_cache
             WHERE embedding IS NOT NULL
               AND created_at >= strftime('%s','now')
                   - (SELECT l3_ttl_secs FROM routing_llm_config WHERE id = 1)",
        )
        .fetch_all(&self.db.ro)
        .await
        .map_err(store_err)?;

        let mut best: Option<(CacheEntry, f32)> = None;
        for row in &rows {
            let entry = cache_entry_from_row(row);
            let Some(vector) = entry.embedding.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(vector, embedding);
            if similarity >= threshold
                && best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true)
            {
                best = Some((entry, similarity));
            }
        }
        debug!(
            candidates = rows.len(),
            hit = best.is_some(),
            "semantic cache scan"
        );
        Ok(best)
    }
}

// ---------------------------------------------------------------------------
// Endpoint catalog
// ---------------------------------------------------------------------------

pub struct SqliteEndpointCatalog {
    db: Database,
}

impl SqliteEndpointCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EndpointCatalog for SqliteEndpointCatalog {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.id AS model_id, m.name AS model_name, m.role, m.cost_per_mtok_input,
                    m.cost_per_mtok_output, m.billing_multiplier, m.weight AS model_weight,
                    m.enabled AS model_enabled,
                    p.id AS provider_id, p.name AS provider_name, p.base_url, p.api_key,
                    p.weight AS provider_weight, p.max_concurrency, p.custom_headers,
                    p.enabled AS provider_enabled
             FROM models m
             JOIN provider_models pm ON pm.model_id = m.id
             JOIN providers p ON p.id = pm.provider_id
             WHERE m.enabled = 1 AND p.enabled = 1
             ORDER BY m.id ASC, p.id ASC",
        )
        .fetch_all(&self.db.rw)
        .await
        .map_err(store_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let custom_headers: HashMap<String, String> =
                    serde_json::from_str(&row.get::<String, _>("custom_headers"))
                        .unwrap_or_default();
                Endpoint {
                    provider: Provider {
                        id: row.get("provider_id"),
                        name: row.get("provider_name"),
                        base_url: row.get("base_url"),
                        api_key: row.get("api_key"),
                        weight: row.get("provider_weight"),
                        max_concurrency: row.get::<i64, _>("max_concurrency").max(0) as u32,
                        custom_headers,
                        enabled: row.get("provider_enabled"),
                    },
                    model: Model {
                        id: row.get("model_id"),
                        name: row.get("model_name"),
                        role: TaskType::parse(&row.get::<String, _>("role")),
                        cost_per_mtok_input: row.get("cost_per_mtok_input"),
                        cost_per_mtok_output: row.get("cost_per_mtok_output"),
                        billing_multiplier: row.get("billing_multiplier"),
                        weight: row.get("model_weight"),
                        enabled: row.get("model_enabled"),
                    },
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Load-balance configuration
// ---------------------------------------------------------------------------

pub struct SqliteBalancerConfigStore {
    db: Database,
}

impl SqliteBalancerConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BalancerConfigStore for SqliteBalancerConfigStore {
    async fn strategy(&self) -> Result<LoadBalanceStrategy, StoreError> {
        let row = sqlx::query("SELECT strategy FROM load_balance_config WHERE id = 1")
            .fetch_optional(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(row
            .map(|r| LoadBalanceStrategy::parse(&r.get::<String, _>("strategy")))
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// An authenticated API key row.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    pub id: i64,
    pub user_id: Option<i64>,
    pub name: String,
}

pub struct SqliteApiKeyStore {
    db: Database,
}

impl SqliteApiKeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find an enabled key by its SHA-256 hash.
    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyAuth>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, name FROM api_keys WHERE key_hash = ? AND enabled = 1",
        )
        .bind(key_hash)
        .fetch_optional(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(row.map(|row| ApiKeyAuth {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
        }))
    }

    /// Record key usage; best effort.
    pub async fn touch(&self, id: i64) {
        let result = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(now_epoch())
            .bind(id)
            .execute(&self.db.rw)
            .await;
        if let Err(e) = result {
            debug!(error = %e, "api key touch failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Request logs
// ---------------------------------------------------------------------------

pub struct SqliteRequestLogStore {
    db: Database,
}

impl SqliteRequestLogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Rows logged so far; used by admin surfaces and tests.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM request_logs")
            .fetch_one(&self.db.ro)
            .await
            .map_err(store_err)?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl RequestLogStore for SqliteRequestLogStore {
    async fn insert_batch(&self, entries: &[RequestLogEntry]) -> Result<(), StoreError> {
        let mut tx = self.db.rw.begin().await.map_err(store_err)?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO request_logs
                     (request_id, user_id, api_key_id, model_name, endpoint_name, task_type,
                      input_tokens, output_tokens, latency_ms, cost, status, success, stream,
                      message_preview, request_body, response_body, routing_method,
                      routing_reason, matched_rule_id, matched_rule_name, all_matches,
                      is_inaccurate, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.request_id)
            .bind(entry.user_id)
            .bind(entry.api_key_id)
            .bind(&entry.model_name)
            .bind(&entry.endpoint_name)
            .bind(&entry.task_type)
            .bind(entry.input_tokens as i64)
            .bind(entry.output_tokens as i64)
            .bind(entry.latency_ms as i64)
            .bind(entry.cost)
            .bind(entry.status as i64)
            .bind(entry.success)
            .bind(entry.stream)
            .bind(&entry.message_preview)
            .bind(&entry.request_body)
            .bind(&entry.response_body)
            .bind(&entry.routing_method)
            .bind(&entry.routing_reason)
            .bind(entry.matched_rule_id)
            .bind(&entry.matched_rule_name)
            .bind(&entry.all_matches)
            .bind(entry.is_inaccurate)
            .bind(entry.created_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker registry and shared state
// ---------------------------------------------------------------------------

pub struct SqliteWorkerStore {
    db: Database,
}

impl SqliteWorkerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Drop workers whose heartbeat is older than `stale_after`.
    pub async fn cleanup_stale(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM worker_registry WHERE last_heartbeat < ?")
            .bind(now_epoch() - stale_after.as_secs() as i64)
            .execute(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    pub async fn register(&self, worker_id: &uuid::Uuid, pid: u32) -> Result<(), StoreError> {
        let now = now_epoch();
        sqlx::query(
            "INSERT INTO worker_registry (worker_id, pid, is_primary, last_heartbeat, created_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT(worker_id) DO UPDATE SET pid = excluded.pid, last_heartbeat = excluded.last_heartbeat",
        )
        .bind(worker_id.to_string())
        .bind(pid as i64)
        .bind(now)
        .bind(now)
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Conditional election: become primary only when no other worker holds
    /// the flag. Returns whether this worker is now primary.
    pub async fn try_become_primary(&self, worker_id: &uuid::Uuid) -> Result<bool, StoreError> {
        let id = worker_id.to_string();
        let result = sqlx::query(
            "UPDATE worker_registry SET is_primary = 1
             WHERE worker_id = ?
               AND NOT EXISTS (
                   SELECT 1 FROM worker_registry WHERE is_primary = 1 AND worker_id != ?
               )",
        )
        .bind(&id)
        .bind(&id)
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn heartbeat(&self, worker_id: &uuid::Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE worker_registry SET last_heartbeat = ? WHERE worker_id = ?")
            .bind(now_epoch())
            .bind(worker_id.to_string())
            .execute(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// True when no live primary exists (no row, or its heartbeat is stale).
    pub async fn primary_is_stale(&self, stale_after: Duration) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM worker_registry
             WHERE is_primary = 1 AND last_heartbeat >= ?",
        )
        .bind(now_epoch() - stale_after.as_secs() as i64)
        .fetch_one(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(row.get::<i64, _>("n") == 0)
    }

    pub async fn deregister(&self, worker_id: &uuid::Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM worker_registry WHERE worker_id = ?")
            .bind(worker_id.to_string())
            .execute(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError> {
        let rows = sqlx::query("SELECT * FROM worker_registry ORDER BY created_at ASC")
            .fetch_all(&self.db.rw)
            .await
            .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|row| WorkerRegistration {
                worker_id: row
                    .get::<String, _>("worker_id")
                    .parse()
                    .unwrap_or_else(|_| uuid::Uuid::nil()),
                pid: row.get::<i64, _>("pid").max(0) as u32,
                is_primary: row.get("is_primary"),
                last_heartbeat: chrono::DateTime::from_timestamp(
                    row.get::<i64, _>("last_heartbeat"),
                    0,
                )
                .unwrap_or_else(chrono::Utc::now),
                created_at: chrono::DateTime::from_timestamp(row.get::<i64, _>("created_at"), 0)
                    .unwrap_or_else(chrono::Utc::now),
            })
            .collect())
    }

    /// Write a JSON value into the shared-state table.
    pub async fn set_shared_state<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::new(e.to_string()))?;
        sqlx::query(
            "INSERT INTO shared_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(raw)
        .bind(now_epoch())
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Read a JSON value from the shared-state table.
    pub async fn get_shared_state<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let row = sqlx::query("SELECT value FROM shared_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db.rw)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => serde_json::from_str(&row.get::<String, _>("value"))
                .map(Some)
                .map_err(|e| StoreError::new(e.to_string())),
            None => Ok(None),
        }
    }

    /// Primary-only sweep: drop routing-cache rows past their layer TTL.
    pub async fn sweep_expired_cache(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM routing_embedding_cache
             WHERE (embedding IS NULL AND created_at < strftime('%s','now')
                        - (SELECT l2_ttl_secs FROM routing_llm_config WHERE id = 1))
                OR (created_at < strftime('%s','now')
                        - (SELECT l3_ttl_secs FROM routing_llm_config WHERE id = 1))",
        )
        .execute(&self.db.rw)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    /// Primary-only rollup: aggregate request totals into shared state for
    /// cheap dashboard reads.
    pub async fn rollup_request_stats(&self) -> Result<(), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(success), 0) AS succeeded,
                    COALESCE(SUM(input_tokens), 0) AS input_tokens,
                    COALESCE(SUM(output_tokens), 0) AS output_tokens,
                    COALESCE(SUM(cost), 0.0) AS cost
             FROM request_logs",
        )
        .fetch_one(&self.db.ro)
        .await
        .map_err(store_err)?;

        let stats = serde_json::json!({
            "total_requests": row.get::<i64, _>("total"),
            "succeeded": row.get::<i64, _>("succeeded"),
            "input_tokens": row.get::<i64, _>("input_tokens"),
            "output_tokens": row.get::<i64, _>("output_tokens"),
            "cost": row.get::<f64, _>("cost"),
            "rolled_up_at": now_epoch(),
        });
        self.set_shared_state("request_stats_rollup", &stats).await
    }
}
