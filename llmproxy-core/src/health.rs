//! # Health Checker
//!
//! Owns per-endpoint mutable state: probe status, connection counters,
//! request totals and a moving-average latency. When probing is disabled
//! every endpoint is initialized healthy so the proxy stays usable; when
//! enabled, a background loop issues concurrent `GET base_url` probes on a
//! fixed interval.
//!
//! Status mapping: `401`/`403` mean the key or quota is bad and mark the
//! endpoint unhealthy; any other status below 400 is healthy; everything
//! else, including transport errors, is unhealthy with the error recorded.
//!
//! Callers only ever see cloned [`EndpointState`] snapshots. Connection
//! counters are clamped at zero.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Endpoint, EndpointState, EndpointStatus};

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug)]
struct StateCell {
    status: EndpointStatus,
    current_connections: i64,
    total_requests: u64,
    total_errors: u64,
    avg_latency_ms: f64,
    last_check: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
}

impl StateCell {
    fn new(status: EndpointStatus) -> Self {
        Self {
            status,
            current_connections: 0,
            total_requests: 0,
            total_errors: 0,
            avg_latency_ms: 0.0,
            last_check: None,
            last_error: None,
        }
    }

    fn snapshot(&self) -> EndpointState {
        EndpointState {
            status: self.status,
            current_connections: self.current_connections,
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            avg_latency_ms: self.avg_latency_ms,
            last_check: self.last_check,
            last_error: self.last_error.clone(),
        }
    }
}

/// Active prober and per-endpoint state registry.
pub struct HealthChecker {
    settings: HealthCheckSettings,
    http: reqwest::Client,
    states: RwLock<HashMap<String, Arc<Mutex<StateCell>>>>,
    endpoints: RwLock<Vec<Endpoint>>,
}

impl HealthChecker {
    pub fn new(settings: HealthCheckSettings) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            http,
            states: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(Vec::new()),
        })
    }

    /// Replace the tracked endpoint set atomically. New endpoints start
    /// `unknown` (`healthy` when probing is disabled); removed endpoints
    /// lose their state; surviving ones keep their counters.
    pub fn update_endpoints(&self, endpoints: &[Endpoint]) {
        let initial = if self.settings.enabled {
            EndpointStatus::Unknown
        } else {
            EndpointStatus::Healthy
        };

        let mut states = self.states.write().unwrap();
        let mut next: HashMap<String, Arc<Mutex<StateCell>>> = HashMap::new();
        for endpoint in endpoints {
            let name = endpoint.name();
            let cell = states
                .remove(&name)
                .unwrap_or_else(|| Arc::new(Mutex::new(StateCell::new(initial))));
            next.insert(name, cell);
        }
        *states = next;
        *self.endpoints.write().unwrap() = endpoints.to_vec();

        info!(count = endpoints.len(), "health checker tracking endpoints");
    }

    /// Run the probe loop until canceled. Returns immediately when probing
    /// is disabled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.settings.enabled {
            info!("health checking disabled, endpoints start healthy");
            return;
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_now().await,
                _ = cancel.cancelled() => {
                    debug!("health probe loop stopped");
                    return;
                }
            }
        }
    }

    /// Probe every tracked endpoint concurrently and update statuses.
    pub async fn check_now(&self) {
        if !self.settings.enabled {
            return;
        }
        let endpoints = self.endpoints.read().unwrap().clone();
        let probes = endpoints.into_iter().map(|endpoint| {
            let http = self.http.clone();
            async move {
                let name = endpoint.name();
                let outcome = probe(&http, &endpoint).await;
                (name, outcome)
            }
        });
        let results = futures::future::join_all(probes).await;

        for (name, outcome) in results {
            if let Some(cell) = self.cell(&name) {
                let mut state = cell.lock().unwrap();
                state.last_check = Some(Utc::now());
                match outcome {
                    Ok(status) => {
                        state.status = status;
                        if status == EndpointStatus::Healthy {
                            state.last_error = None;
                        }
                    }
                    Err(message) => {
                        state.status = EndpointStatus::Unhealthy;
                        state.last_error = Some(message);
                    }
                }
            }
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.status(name) == EndpointStatus::Healthy
    }

    pub fn status(&self, name: &str) -> EndpointStatus {
        self.cell(name)
            .map(|c| c.lock().unwrap().status)
            .unwrap_or(EndpointStatus::Unknown)
    }

    /// Bracket an upstream call: bump the live connection count.
    pub fn increment_connections(&self, name: &str) {
        if let Some(cell) = self.cell(name) {
            cell.lock().unwrap().current_connections += 1;
        }
    }

    /// Close the bracket. Clamped at zero.
    pub fn decrement_connections(&self, name: &str) {
        if let Some(cell) = self.cell(name) {
            let mut state = cell.lock().unwrap();
            state.current_connections = (state.current_connections - 1).max(0);
        }
    }

    /// Record one finished upstream request. Totals and the moving-average
    /// latency update together under the state lock.
    pub fn record_request(&self, name: &str, success: bool, latency_ms: u64) {
        if let Some(cell) = self.cell(name) {
            let mut state = cell.lock().unwrap();
            state.total_requests += 1;
            if !success {
                state.total_errors += 1;
            }
            if state.avg_latency_ms == 0.0 {
                state.avg_latency_ms = latency_ms as f64;
            } else {
                // Exponential moving average, light smoothing.
                state.avg_latency_ms = 0.1 * latency_ms as f64 + 0.9 * state.avg_latency_ms;
            }
        }
    }

    /// Copy-safe snapshot of one endpoint's state.
    pub fn state(&self, name: &str) -> Option<EndpointState> {
        self.cell(name).map(|c| c.lock().unwrap().snapshot())
    }

    /// Copy-safe snapshot of every tracked endpoint.
    pub fn all_states(&self) -> HashMap<String, EndpointState> {
        let states = self.states.read().unwrap();
        states
            .iter()
            .map(|(name, cell)| (name.clone(), cell.lock().unwrap().snapshot()))
            .collect()
    }

    fn cell(&self, name: &str) -> Option<Arc<Mutex<StateCell>>> {
        self.states.read().unwrap().get(name).cloned()
    }
}

async fn probe(http: &reqwest::Client, endpoint: &Endpoint) -> Result<EndpointStatus, String> {
    let response = http
        .get(&endpoint.provider.base_url)
        .header("x-api-key", &endpoint.provider.api_key)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status().as_u16();
    Ok(match status {
        401 | 403 => {
            warn!(endpoint = %endpoint.name(), status, "probe rejected, key or quota problem");
            EndpointStatus::Unhealthy
        }
        s if s < 400 => EndpointStatus::Healthy,
        _ => EndpointStatus::Unhealthy,
    })
}

/// RAII connection bracket. Increments on construction, decrements on drop,
/// so early returns and panics cannot leak a connection count.
pub struct ConnectionGuard {
    checker: Arc<HealthChecker>,
    name: String,
}

impl ConnectionGuard {
    pub fn new(checker: Arc<HealthChecker>, name: String) -> Self {
        checker.increment_connections(&name);
        Self { checker, name }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.checker.decrement_connections(&self.name);
    }
}
