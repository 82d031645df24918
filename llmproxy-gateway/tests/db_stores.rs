//! Repository tests over a real (temporary) SQLite database: schema
//! bootstrap, rule and config mapping, cache TTL semantics, the endpoint
//! catalog join, and batched request-log writes.

use llmproxy_core::models::{CacheEntry, RequestLogEntry, TaskType};
use llmproxy_core::stores::{
    EndpointCatalog, RequestLogStore, RouteCacheStore, RoutingConfigStore, RoutingRuleStore,
};
use llmproxy_gateway::auth::hash_api_key;
use llmproxy_gateway::config::DatabaseConfig;
use llmproxy_gateway::db::{
    Database, SqliteApiKeyStore, SqliteEndpointCatalog, SqliteRequestLogStore,
    SqliteRouteCacheStore, SqliteRoutingConfigStore, SqliteRoutingRuleStore,
};

async fn temp_db() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: dir.path().join("stores.db").to_string_lossy().into_owned(),
        ..Default::default()
    };
    (Database::open(&config).await.unwrap(), dir)
}

fn cache_entry(hash: &str, task_type: TaskType, embedding: Option<Vec<f32>>) -> CacheEntry {
    CacheEntry {
        content_hash: hash.to_string(),
        content_preview: "preview".to_string(),
        embedding,
        task_type,
        reason: "cached reason".to_string(),
        created_at: chrono::Utc::now(),
        hit_count: 0,
    }
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: dir.path().join("boot.db").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let first = Database::open(&config).await.unwrap();
    drop(first);
    // A second open against the same file must not fail.
    Database::open(&config).await.unwrap();
}

#[tokio::test]
async fn rule_store_roundtrip_and_hit_count() {
    let (db, _dir) = temp_db().await;
    sqlx::query(
        "INSERT INTO routing_rules (name, keywords, pattern, condition, task_type, priority, enabled)
         VALUES ('ops_rule', '[\"deploy\",\"rollback\"]', '', 'len(message) > 10', 'complex', 42, 1)",
    )
    .execute(&db.rw)
    .await
    .unwrap();

    let store = SqliteRoutingRuleStore::new(db.clone());
    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    let rule = &rules[0];
    assert_eq!(rule.name, "ops_rule");
    assert_eq!(rule.keywords, vec!["deploy", "rollback"]);
    assert_eq!(rule.task_type, TaskType::Complex);
    assert_eq!(rule.priority, 42);
    assert!(!rule.is_builtin);

    store.increment_hit(rule.id).await.unwrap();
    store.increment_hit(rule.id).await.unwrap();
    let rules = store.list_rules().await.unwrap();
    assert_eq!(rules[0].hit_count, 2);

    // Builtin ids are not rows; incrementing them is a no-op, not an error.
    store.increment_hit(-1).await.unwrap();
}

#[tokio::test]
async fn routing_config_row_maps_to_engine_config() {
    let (db, _dir) = temp_db().await;
    let store = SqliteRoutingConfigStore::new(db.clone());

    let config = store.load().await.unwrap();
    assert!(config.rule_based_enabled);
    assert!(!config.llm_enabled);
    assert_eq!(config.l1_ttl_secs, 300);
    assert_eq!(config.l1_capacity, 10_000);
    assert_eq!(config.l3_ttl_secs, 604_800);
    assert!((config.similarity_threshold - 0.82).abs() < 1e-6);

    sqlx::query(
        "UPDATE routing_llm_config
         SET llm_enabled = 1, fallback_strategy = 'llm', fallback_task_type = 'complex',
             force_smart_routing = 1
         WHERE id = 1",
    )
    .execute(&db.rw)
    .await
    .unwrap();

    let config = store.load().await.unwrap();
    assert!(config.llm_enabled);
    assert!(config.force_smart_routing);
    assert_eq!(
        config.fallback_strategy,
        llmproxy_core::FallbackStrategy::Llm
    );
    assert_eq!(config.fallback_task_type, TaskType::Complex);
}

#[tokio::test]
async fn cache_store_exact_hits_and_ttl_expiry() {
    let (db, _dir) = temp_db().await;
    let store = SqliteRouteCacheStore::new(db.clone());

    store
        .insert(&cache_entry("hash-fresh", TaskType::Complex, None))
        .await
        .unwrap();
    let hit = store.get_exact("hash-fresh").await.unwrap().unwrap();
    assert_eq!(hit.task_type, TaskType::Complex);
    assert_eq!(hit.reason, "cached reason");

    store.increment_hit("hash-fresh").await.unwrap();
    assert_eq!(
        store.get_exact("hash-fresh").await.unwrap().unwrap().hit_count,
        1
    );

    // An entry written past the L2 TTL is invisible to exact lookups.
    let mut stale = cache_entry("hash-stale", TaskType::Simple, None);
    stale.created_at = chrono::Utc::now() - chrono::Duration::days(30);
    store.insert(&stale).await.unwrap();
    assert!(store.get_exact("hash-stale").await.unwrap().is_none());

    assert!(store.get_exact("never-written").await.unwrap().is_none());
}

#[tokio::test]
async fn semantic_search_ignores_entries_without_embeddings() {
    let (db, _dir) = temp_db().await;
    let store = SqliteRouteCacheStore::new(db.clone());

    store
        .insert(&cache_entry("no-vector", TaskType::Simple, None))
        .await
        .unwrap();
    store
        .insert(&cache_entry(
            "close",
            TaskType::Complex,
            Some(vec![1.0, 0.0, 0.0]),
        ))
        .await
        .unwrap();
    store
        .insert(&cache_entry(
            "closer",
            TaskType::Default,
            Some(vec![0.9, 0.1, 0.0]),
        ))
        .await
        .unwrap();

    // Identical to the "closer" vector, so it wins with similarity 1.
    let query = vec![0.9f32, 0.1, 0.0];
    let (best, similarity) = store
        .best_semantic_match(&query, 0.82)
        .await
        .unwrap()
        .expect("embedded entries should match");
    assert_eq!(best.content_hash, "closer");
    assert!(similarity > 0.999);

    // An impossible threshold finds nothing.
    assert!(store
        .best_semantic_match(&query, 1.01)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn endpoint_catalog_joins_enabled_rows_only() {
    let (db, _dir) = temp_db().await;

    sqlx::query(
        "INSERT INTO providers (id, name, base_url, api_key, weight, custom_headers, enabled) VALUES
            (1, 'up', 'https://up.example', 'k1', 2, '{\"x-region\":\"eu\"}', 1),
            (2, 'down', 'https://down.example', 'k2', 1, '{}', 0)",
    )
    .execute(&db.rw)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO models (id, name, role, weight, enabled) VALUES
            (1, 'claude-sonnet', 'default', 5, 1),
            (2, 'claude-retired', 'default', 5, 0)",
    )
    .execute(&db.rw)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO provider_models (provider_id, model_id) VALUES (1, 1), (2, 1), (1, 2)",
    )
    .execute(&db.rw)
    .await
    .unwrap();

    let catalog = SqliteEndpointCatalog::new(db);
    let endpoints = catalog.list_endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 1, "disabled rows are filtered in SQL");
    let endpoint = &endpoints[0];
    assert_eq!(endpoint.name(), "up/claude-sonnet");
    assert_eq!(endpoint.model.role, TaskType::Default);
    assert_eq!(
        endpoint.provider.custom_headers.get("x-region").unwrap(),
        "eu"
    );
}

#[tokio::test]
async fn api_key_lookup_is_by_hash_and_enabled() {
    let (db, _dir) = temp_db().await;
    sqlx::query(
        "INSERT INTO api_keys (name, key_hash, enabled) VALUES
            ('live', ?, 1),
            ('revoked', ?, 0)",
    )
    .bind(hash_api_key("sk-proxy-live"))
    .bind(hash_api_key("sk-proxy-revoked"))
    .execute(&db.rw)
    .await
    .unwrap();

    let store = SqliteApiKeyStore::new(db);
    let auth = store
        .find_by_hash(&hash_api_key("sk-proxy-live"))
        .await
        .unwrap()
        .expect("live key resolves");
    assert_eq!(auth.name, "live");

    assert!(store
        .find_by_hash(&hash_api_key("sk-proxy-revoked"))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .find_by_hash(&hash_api_key("sk-proxy-unknown"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn request_log_batches_preserve_order() {
    let (db, _dir) = temp_db().await;
    let store = SqliteRequestLogStore::new(db.clone());

    let entries: Vec<RequestLogEntry> = (0..5)
        .map(|i| RequestLogEntry {
            request_id: format!("req-{i}"),
            user_id: None,
            api_key_id: None,
            model_name: "m".to_string(),
            endpoint_name: "p/m".to_string(),
            task_type: "default".to_string(),
            input_tokens: i,
            output_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            status: 200,
            success: true,
            stream: false,
            message_preview: String::new(),
            request_body: None,
            response_body: None,
            routing_method: "rule".to_string(),
            routing_reason: String::new(),
            matched_rule_id: Some(-2),
            matched_rule_name: Some("architecture_design".to_string()),
            all_matches: None,
            is_inaccurate: false,
            created_at: chrono::Utc::now(),
        })
        .collect();

    store.insert_batch(&entries).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 5);

    use sqlx::Row;
    let rows = sqlx::query("SELECT request_id FROM request_logs ORDER BY id ASC")
        .fetch_all(&db.ro)
        .await
        .unwrap();
    let ids: Vec<String> = rows.iter().map(|r| r.get("request_id")).collect();
    assert_eq!(ids, ["req-0", "req-1", "req-2", "req-3", "req-4"]);
}
