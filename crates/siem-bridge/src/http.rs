// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Health and metrics HTTP endpoints.
//!
//! - `GET /health` -- 200 when the bus is connected, the store has written
//!   recently, and the circuit is not stuck open; 503 otherwise
//! - `GET /metrics` -- Prometheus text exposition
//! - `GET /stats` -- JSON snapshot

use crate::stats::BridgeStats;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

type ConnectedFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared endpoint state.
pub struct HttpState {
    pub stats: Arc<BridgeStats>,
    pub bus_connected: ConnectedFn,
    /// Stale-write threshold before /health degrades.
    pub health_threshold: Duration,
    /// How long the circuit may stay open before /health degrades.
    pub unhealthy_open_duration: Duration,
}

impl HttpState {
    fn health_verdict(&self) -> Result<(), String> {
        if !(self.bus_connected)() {
            return Err("bus disconnected".to_string());
        }

        if let Some(since_ms) = self.stats.since_last_write_ms() {
            if since_ms > self.health_threshold.as_millis() as u64 {
                return Err(format!("last store write {since_ms}ms ago"));
            }
        }

        if let Some(open_ms) = self.stats.circuit_open_for_ms() {
            if open_ms > self.unhealthy_open_duration.as_millis() as u64 {
                return Err(format!("circuit open for {open_ms}ms"));
            }
        }

        Ok(())
    }
}

/// Build the endpoint router.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<HttpState>>) -> Response {
    match state.health_verdict() {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(reason) => {
            (StatusCode::SERVICE_UNAVAILABLE, format!("unhealthy: {reason}")).into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<HttpState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.stats.render_prometheus(),
    )
        .into_response()
}

async fn stats(State(state): State<Arc<HttpState>>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

/// Serve the endpoints until the shutdown signal flips.
pub async fn serve(
    state: Arc<HttpState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("metrics endpoint listening on :{port}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
