//! Local HTTP service front.
//!
//! Handlers never touch control-plane state directly: every question goes
//! through the broker and suspends only the asking task. Responses use a
//! uniform `{status, ...}` / `{status: "error", error}` envelope; raw
//! driver/owner errors are never propagated unwrapped.

pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tracing::info;

use lakeloop_core::broker::BrokerHandle;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: BrokerHandle,
    pub data_dir: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/resources", get(handlers::list_resources))
        .route(
            "/api/resources/{name}/metadata",
            get(handlers::resource_metadata),
        )
        .route("/api/resources/{name}/ingest", post(handlers::ingest))
        .route("/api/jobs", post(handlers::trigger_job))
        .with_state(state)
}

/// Serve the local API until the token is cancelled. Binds loopback only.
pub async fn serve(port: u16, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind service front to {addr}"))?;

    info!("Service front listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Service front failed")
}
