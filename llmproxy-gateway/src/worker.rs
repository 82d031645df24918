//! # Worker Coordinator
//!
//! Several proxy processes can share one database; exactly one of them is
//! primary at a time and runs the singleton background jobs (routing-cache
//! sweep, request-stats rollup).
//!
//! Startup: purge workers whose heartbeat is older than 30 seconds,
//! register this process under a fresh UUID, then attempt a conditional
//! election ("become primary unless another row already is"). The
//! heartbeat loop refreshes this worker's row every 10 seconds; a
//! non-primary worker that notices a stale primary cleans up and re-runs
//! the election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::SqliteWorkerStore;
use llmproxy_core::stores::StoreError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const STALE_AFTER: Duration = Duration::from_secs(30);
const SINGLETON_JOB_INTERVAL: Duration = Duration::from_secs(300);

pub struct WorkerCoordinator {
    store: Arc<SqliteWorkerStore>,
    worker_id: Uuid,
    pid: u32,
    primary: AtomicBool,
}

impl WorkerCoordinator {
    pub fn new(store: Arc<SqliteWorkerStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            worker_id: Uuid::new_v4(),
            pid: std::process::id(),
            primary: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Register this worker and run the initial election.
    pub async fn start(&self) -> Result<bool, StoreError> {
        self.store.cleanup_stale(STALE_AFTER).await?;
        self.store.register(&self.worker_id, self.pid).await?;
        let elected = self.store.try_become_primary(&self.worker_id).await?;
        self.primary.store(elected, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, primary = elected, "worker registered");
        Ok(elected)
    }

    /// Heartbeat loop; also re-runs the election when the primary goes
    /// stale. Runs until canceled.
    pub fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.beat().await,
                    _ = cancel.cancelled() => {
                        debug!(worker_id = %this.worker_id, "heartbeat loop stopped");
                        return;
                    }
                }
            }
        })
    }

    async fn beat(&self) {
        if let Err(e) = self.store.heartbeat(&self.worker_id).await {
            warn!(error = %e, "heartbeat write failed");
            return;
        }

        if self.is_primary() {
            return;
        }

        match self.store.primary_is_stale(STALE_AFTER).await {
            Ok(true) => {
                if let Err(e) = self.store.cleanup_stale(STALE_AFTER).await {
                    warn!(error = %e, "stale worker cleanup failed");
                }
                match self.store.try_become_primary(&self.worker_id).await {
                    Ok(true) => {
                        info!(worker_id = %self.worker_id, "promoted to primary worker");
                        self.primary.store(true, Ordering::SeqCst);
                    }
                    Ok(false) => debug!("another worker won the election"),
                    Err(e) => warn!(error = %e, "election failed"),
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "primary staleness check failed"),
        }
    }

    /// Singleton jobs, executed only while this worker is primary.
    pub fn spawn_singleton_jobs(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SINGLETON_JOB_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !this.is_primary() {
                            continue;
                        }
                        match this.store.sweep_expired_cache().await {
                            Ok(0) => {}
                            Ok(n) => info!(swept = n, "expired routing-cache rows removed"),
                            Err(e) => warn!(error = %e, "cache sweep failed"),
                        }
                        if let Err(e) = this.store.rollup_request_stats().await {
                            warn!(error = %e, "stats rollup failed");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    /// Remove this worker's registration on shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.store.deregister(&self.worker_id).await {
            warn!(error = %e, "worker deregistration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::Database;

    async fn temp_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir
                .path()
                .join("workers.db")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        };
        (Database::open(&config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn only_one_worker_becomes_primary() {
        let (db, _dir) = temp_db().await;
        let store = Arc::new(SqliteWorkerStore::new(db));

        let a = WorkerCoordinator::new(store.clone());
        let b = WorkerCoordinator::new(store.clone());

        assert!(a.start().await.unwrap());
        assert!(!b.start().await.unwrap());
        assert!(a.is_primary());
        assert!(!b.is_primary());

        // The store view agrees with the in-process flags.
        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers.iter().filter(|w| w.is_primary).count(), 1);
    }

    #[tokio::test]
    async fn secondary_takes_over_after_primary_disappears() {
        let (db, _dir) = temp_db().await;
        let store = Arc::new(SqliteWorkerStore::new(db));

        let a = WorkerCoordinator::new(store.clone());
        let b = WorkerCoordinator::new(store.clone());
        assert!(a.start().await.unwrap());
        assert!(!b.start().await.unwrap());

        // Primary's row disappears, as after a crash-and-cleanup.
        a.shutdown().await;
        assert!(store.primary_is_stale(STALE_AFTER).await.unwrap());

        b.beat().await;
        assert!(b.is_primary());
    }

    #[tokio::test]
    async fn shared_state_roundtrip() {
        let (db, _dir) = temp_db().await;
        let store = SqliteWorkerStore::new(db);

        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Stats {
            swept: u64,
        }

        store
            .set_shared_state("cache_sweep", &Stats { swept: 42 })
            .await
            .unwrap();
        let read: Option<Stats> = store.get_shared_state("cache_sweep").await.unwrap();
        assert_eq!(read, Some(Stats { swept: 42 }));

        let missing: Option<Stats> = store.get_shared_state("absent").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn stale_workers_are_cleaned_up_on_start() {
        let (db, _dir) = temp_db().await;
        let store = Arc::new(SqliteWorkerStore::new(db.clone()));

        // A dead worker with an ancient heartbeat.
        let ghost = Uuid::new_v4();
        store.register(&ghost, 1).await.unwrap();
        sqlx::query("UPDATE worker_registry SET last_heartbeat = 0, is_primary = 1 WHERE worker_id = ?")
            .bind(ghost.to_string())
            .execute(&db.rw)
            .await
            .unwrap();

        let fresh = WorkerCoordinator::new(store.clone());
        assert!(fresh.start().await.unwrap(), "election succeeds once the ghost is purged");
        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, fresh.worker_id());
    }
}
