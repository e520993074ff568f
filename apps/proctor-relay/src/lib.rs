//! Signaling relay for live proctoring.
//!
//! The relay keeps a directory of registered sessions and forwards signaling
//! (offers, answers, ICE candidates) and stream control messages between a
//! teacher and a student. Media never passes through it.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod directory;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use proctor_protocol::Role;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::catalog::{OpenCatalog, StaticCatalog, TestCatalog};
use crate::config::RelayConfig;
use crate::directory::SessionDirectory;
use crate::relay::SignalingRelay;

pub struct AppState {
    pub relay: SignalingRelay,
    pub catalog: Arc<dyn TestCatalog>,
    pub registration_timeout: Duration,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        let catalog: Arc<dyn TestCatalog> = match &config.active_tests {
            Some(tests) => Arc::new(StaticCatalog::new(tests.iter().copied())),
            None => Arc::new(OpenCatalog),
        };
        Self::with_catalog(config, catalog, metrics)
    }

    pub fn with_catalog(
        config: &RelayConfig,
        catalog: Arc<dyn TestCatalog>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            relay: SignalingRelay::new(SessionDirectory::new()),
            catalog,
            registration_timeout: config.registration_timeout,
            metrics,
        }
    }

    pub fn directory(&self) -> &SessionDirectory {
        self.relay.directory()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    user_id: String,
    role: Role,
    test_id: i64,
    connection_id: String,
    registered_at: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/sessions", get(sessions_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("proctor-relay listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<SessionView> = state
        .directory()
        .snapshot()
        .into_iter()
        .map(|session| SessionView {
            user_id: session.user_id,
            role: session.role,
            test_id: session.test_id,
            connection_id: session.connection_id.to_string(),
            registered_at: session.registered_at.unix_timestamp(),
        })
        .collect();
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
