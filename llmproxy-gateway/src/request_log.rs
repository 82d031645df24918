//! # Request Log Sink
//!
//! Durable, asynchronous record of every served request. One background
//! task owns a bounded channel (capacity 1000) and a 5 second ticker; it
//! accumulates up to 100 entries, then flushes, and also flushes on tick
//! and at shutdown. When the channel is full the caller degrades to a
//! synchronous write bounded by a 5 second timeout, so bursts slow callers
//! down instead of dropping records.
//!
//! Flushes preserve insertion order within a batch.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use llmproxy_core::models::{ClassifyResult, RoutingDecision};
use llmproxy_core::stores::RequestLogStore;
use llmproxy_core::RequestLogEntry;

const QUEUE_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const SYNC_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RequestLogSink {
    tx: Mutex<Option<mpsc::Sender<RequestLogEntry>>>,
    store: Arc<dyn RequestLogStore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestLogSink {
    /// Start the sink and its writer task.
    pub fn start(store: Arc<dyn RequestLogStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(write_loop(rx, store.clone()));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            store,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue one entry. Falls back to a bounded synchronous write when the
    /// queue is full or the sink is already shut down.
    pub async fn log_request(&self, entry: RequestLogEntry) {
        let sender = self.tx.lock().unwrap().clone();
        if let Some(sender) = sender {
            match sender.try_send(entry) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(entry)) => {
                    warn!("request log queue full, writing synchronously");
                    self.write_direct(entry).await;
                }
                Err(mpsc::error::TrySendError::Closed(entry)) => {
                    self.write_direct(entry).await;
                }
            }
        }
    }

    async fn write_direct(&self, entry: RequestLogEntry) {
        let write = self.store.insert_batch(std::slice::from_ref(&entry));
        match tokio::time::timeout(SYNC_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "synchronous request log write failed"),
            Err(_) => warn!("synchronous request log write timed out"),
        }
    }

    /// Close the queue and wait for the writer to drain.
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().unwrap().take();
        drop(sender);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn write_loop(mut rx: mpsc::Receiver<RequestLogEntry>, store: Arc<dyn RequestLogStore>) {
    let mut batch: Vec<RequestLogEntry> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= BATCH_SIZE {
                        flush(&store, &mut batch).await;
                    }
                }
                None => {
                    flush(&store, &mut batch).await;
                    debug!("request log sink drained");
                    return;
                }
            },
            _ = ticker.tick() => flush(&store, &mut batch).await,
        }
    }
}

async fn flush(store: &Arc<dyn RequestLogStore>, batch: &mut Vec<RequestLogEntry>) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    if let Err(e) = store.insert_batch(&entries).await {
        warn!(count = entries.len(), error = %e, "request log batch write failed");
    }
}

/// Routing method label for a log row, derived from the decision trace.
pub fn routing_method(decision: Option<&RoutingDecision>) -> String {
    match decision {
        None => "fallback".to_string(),
        Some(d) if d.from_cache => match d.cache_type.as_str() {
            "L1" => "cache_l1".to_string(),
            "L2" => "cache_l2".to_string(),
            "L3" => "cache_l3".to_string(),
            other => format!("cache_{}", other.to_lowercase()),
        },
        Some(d) if d.cache_type == "rule" => "rule".to_string(),
        Some(d) if !d.model_used.is_empty() => "llm".to_string(),
        Some(_) => "fallback".to_string(),
    }
}

/// First 200 runes of the user message, for the log row.
pub fn message_preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Serialize the full rule-hit trace for the `all_matches` column.
pub fn all_matches_json(rule_match: Option<&ClassifyResult>) -> Option<String> {
    rule_match
        .filter(|r| !r.hits.is_empty())
        .and_then(|r| serde_json::to_string(&r.hits).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llmproxy_core::models::TaskType;
    use llmproxy_core::stores::StoreError;

    #[derive(Default)]
    struct MemoryLogStore {
        rows: Mutex<Vec<RequestLogEntry>>,
    }

    #[async_trait]
    impl RequestLogStore for MemoryLogStore {
        async fn insert_batch(&self, entries: &[RequestLogEntry]) -> Result<(), StoreError> {
            self.rows.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }
    }

    fn entry(request_id: &str) -> RequestLogEntry {
        RequestLogEntry {
            request_id: request_id.to_string(),
            user_id: None,
            api_key_id: None,
            model_name: "m".to_string(),
            endpoint_name: "p/m".to_string(),
            task_type: "default".to_string(),
            input_tokens: 1,
            output_tokens: 2,
            latency_ms: 3,
            cost: 0.0,
            status: 200,
            success: true,
            stream: false,
            message_preview: String::new(),
            request_body: None,
            response_body: None,
            routing_method: "rule".to_string(),
            routing_reason: String::new(),
            matched_rule_id: None,
            matched_rule_name: None,
            all_matches: None,
            is_inaccurate: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_entries_in_order() {
        let store = Arc::new(MemoryLogStore::default());
        let sink = RequestLogSink::start(store.clone());

        for i in 0..7 {
            sink.log_request(entry(&format!("r{i}"))).await;
        }
        sink.shutdown().await;

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 7);
        let ids: Vec<&str> = rows.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2", "r3", "r4", "r5", "r6"]);
    }

    #[tokio::test]
    async fn batch_boundary_triggers_flush_without_tick() {
        let store = Arc::new(MemoryLogStore::default());
        let sink = RequestLogSink::start(store.clone());

        for i in 0..BATCH_SIZE {
            sink.log_request(entry(&format!("r{i}"))).await;
        }
        // The batch flush happens without waiting for the 5s ticker.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.rows.lock().unwrap().len(), BATCH_SIZE);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn logging_after_shutdown_writes_directly() {
        let store = Arc::new(MemoryLogStore::default());
        let sink = RequestLogSink::start(store.clone());
        sink.shutdown().await;

        sink.log_request(entry("late")).await;
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[test]
    fn routing_method_derivation() {
        assert_eq!(routing_method(None), "fallback");

        let rule = RoutingDecision {
            task_type: TaskType::Complex,
            reason: String::new(),
            from_cache: false,
            cache_type: "rule".to_string(),
            model_used: String::new(),
        };
        assert_eq!(routing_method(Some(&rule)), "rule");

        let l2 = RoutingDecision {
            from_cache: true,
            cache_type: "L2".to_string(),
            ..rule.clone()
        };
        assert_eq!(routing_method(Some(&l2)), "cache_l2");

        let llm = RoutingDecision {
            cache_type: String::new(),
            model_used: "router-mini".to_string(),
            ..rule.clone()
        };
        assert_eq!(routing_method(Some(&llm)), "llm");

        let fallback = RoutingDecision {
            cache_type: String::new(),
            model_used: String::new(),
            ..rule
        };
        assert_eq!(routing_method(Some(&fallback)), "fallback");
    }

    #[test]
    fn preview_truncates_runes() {
        let long: String = "设".repeat(300);
        assert_eq!(message_preview(&long).chars().count(), 200);
        assert_eq!(message_preview("short"), "short");
    }
}
