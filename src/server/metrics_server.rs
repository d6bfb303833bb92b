// src/server/metrics_server.rs

use crate::core::metrics::{self, gather_metrics};
use crate::core::state::BridgeState;
use anyhow::{Context, Result};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Handles HTTP requests to the /metrics endpoint.
///
/// Refreshes the session gauge from the registry before gathering.
async fn metrics_handler(state: Arc<BridgeState>) -> impl IntoResponse {
    metrics::CONNECTED_SESSIONS.set(state.registry.len() as f64);

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Handles HTTP requests to the /sessions endpoint with a JSON snapshot of the registry.
async fn sessions_handler(state: Arc<BridgeState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

/// Runs a simple HTTP server exposing `/metrics` and `/sessions`.
pub async fn run_metrics_server(
    state: Arc<BridgeState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let port = state.config.metrics.port;

    let metrics_state = state.clone();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || metrics_handler(metrics_state.clone())),
        )
        .route("/sessions", get(move || sessions_handler(state.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on port {port}"))?;
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .context("Metrics server failed")
}
