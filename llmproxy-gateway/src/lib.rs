//! # llmproxy-gateway
//!
//! The server shell around [`llmproxy_core`]: an axum HTTP server exposing
//! the Anthropic-compatible `POST /v1/messages` endpoint and an
//! unauthenticated `GET /api/health` summary, backed by a shared SQLite
//! database.
//!
//! This crate owns everything stateful outside the request path:
//!
//! - **`db`**: SQLite pools (WAL, split read/write and read-only) and the
//!   repository implementations behind the engine's store traits.
//! - **`request_log`**: the batched async request-log sink.
//! - **`worker`**: multi-process coordination: registration, primary
//!   election, heartbeats and primary-only maintenance jobs.
//! - **`auth`**: API-key verification and password formats.
//! - **`server`** / **`handlers`**: wiring and the HTTP surface.

pub mod auth;
pub mod config;
pub mod db;
pub mod gateway_error;
pub mod handlers;
pub mod request_log;
pub mod server;
pub mod worker;

pub use config::Config;
pub use server::{create_server, AppState};
