//! # llmproxy-gateway binary
//!
//! Smart reverse proxy for Anthropic-compatible chat traffic.
//!
//! ```bash
//! # Default configuration (config.toml beside the binary)
//! llmproxy-gateway
//!
//! # Explicit configuration and overrides
//! llmproxy-gateway --config /etc/llmproxy/config.toml --port 8080 --log-level debug
//! ```
//!
//! Fatal startup failures (unreadable config, database open, schema
//! bootstrap) exit the process; everything after startup degrades instead
//! of dying.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use llmproxy_gateway::{create_server, Config};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the configured bind address
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter (overrides the config file and RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    config.validate()?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let drain_budget = Duration::from_secs(config.server.timeout_secs.max(1));
    let (app, state) = create_server(config).await?;

    tracing::info!(%addr, "llmproxy gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    // Drain in-flight connections (streams included) for up to the
    // configured budget, then drop whatever is still open.
    tokio::select! {
        result = serve => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(drain_budget).await;
        } => {
            tracing::warn!(
                budget_secs = drain_budget.as_secs(),
                "drain budget exhausted, closing remaining connections"
            );
        }
    }

    state.shutdown().await;
    tracing::info!("llmproxy gateway stopped");

    Ok(())
}
