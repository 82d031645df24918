//! # Endpoint Store
//!
//! Authoritative snapshot of the reachable (provider, model) pairs for the
//! request path. Reload rebuilds the list from the catalog and swaps it in
//! atomically; readers fetch an `Arc` under a read lock and keep using the
//! same snapshot for the rest of their request.
//!
//! The store and the health checker reference each other at runtime: the
//! store notifies the checker on reload, the checker reads endpoint
//! definitions for probing. Construction breaks the cycle by building both
//! and injecting the checker afterwards via [`EndpointStore::set_health_checker`].

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::health::HealthChecker;
use crate::models::Endpoint;
use crate::stores::{EndpointCatalog, StoreError};

pub struct EndpointStore {
    catalog: Arc<dyn EndpointCatalog>,
    snapshot: RwLock<Arc<Vec<Endpoint>>>,
    checker: RwLock<Option<Arc<HealthChecker>>>,
}

impl EndpointStore {
    pub fn new(catalog: Arc<dyn EndpointCatalog>) -> Self {
        Self {
            catalog,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            checker: RwLock::new(None),
        }
    }

    /// Inject the health checker after construction.
    pub fn set_health_checker(&self, checker: Arc<HealthChecker>) {
        *self.checker.write().unwrap() = Some(checker);
    }

    /// Current snapshot. Zero-copy; the lock is held only to clone the Arc.
    pub fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.snapshot.read().unwrap().clone()
    }

    /// Rebuild the endpoint list from the catalog, replace the snapshot
    /// atomically, and notify the health checker. Duplicate
    /// (provider, model) rows are dropped, keeping the first occurrence.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let listed = self.catalog.list_endpoints().await?;

        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        let mut endpoints = Vec::with_capacity(listed.len());
        for endpoint in listed {
            if seen.insert((endpoint.provider.id, endpoint.model.id)) {
                endpoints.push(endpoint);
            } else {
                warn!(endpoint = %endpoint.name(), "dropping duplicate endpoint row");
            }
        }

        let count = endpoints.len();
        let shared = Arc::new(endpoints);
        *self.snapshot.write().unwrap() = shared.clone();

        if let Some(checker) = self.checker.read().unwrap().clone() {
            checker.update_endpoints(&shared);
        }

        info!(count, "endpoint snapshot reloaded");
        Ok(count)
    }
}
