//! # Gateway Configuration
//!
//! Startup configuration from a TOML file, with CLI overrides for host,
//! port and log level. Only process-level settings live here; everything an
//! operator tunes at runtime (routing config, load-balance strategy, the
//! health-check singleton) lives in the database.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8787
//! timeout_secs = 30
//!
//! [database]
//! path = "llmproxy.db"
//! busy_timeout_secs = 5
//! read_pool_size = 16
//! write_pool_size = 4
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server binding and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful-shutdown drain budget: how long in-flight connections may
    /// keep running after the shutdown signal before they are dropped. Not
    /// a per-request timeout; streams stay open until the client cancels.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// SQLite location and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    /// Read-only pool for analytical scans
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: u32,
    /// Read/write pool for the request path
    #[serde(default = "default_write_pool_size")]
    pub write_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_secs: default_busy_timeout_secs(),
            read_pool_size: default_read_pool_size(),
            write_pool_size: default_write_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    "llmproxy.db".to_string()
}
fn default_busy_timeout_secs() -> u64 {
    5
}
fn default_read_pool_size() -> u32 {
    16
}
fn default_write_pool_size() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults so the
    /// proxy can start with nothing but a database path.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.database.path.trim().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }
        if self.database.write_pool_size == 0 || self.database.read_pool_size == 0 {
            anyhow::bail!("database pool sizes must be non-zero");
        }
        Ok(())
    }
}
