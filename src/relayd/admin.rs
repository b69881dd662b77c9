//! Admin HTTP API: `axum` + `tower-http` (CORS + trace) exposing `/health`,
//! `/metrics` (raw
//! Prometheus exposition text), `/conns` (the live connection snapshot),
//! and `/reload` (POST, bumps the reload signal the config watcher acts
//! on). None of this touches the data path; handlers only register/
//! unregister themselves in the `ConnRegistry` and bump counters.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::relayd::telemetry::{self, SharedConns, SharedPrometheusHandle};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    pub conns: SharedConns,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

pub async fn serve(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    serve_with_shutdown(addr, state, futures_never_resolves()).await
}

/// Runs the admin server until `shutdown` resolves, then stops accepting and
/// lets in-flight requests finish.
pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/config", get(config))
        .route("/reload", post(reload))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn futures_never_resolves() {
    std::future::pending::<()>().await
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.conns.snapshot()))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(ConfigResponse { path: st.config_path.display().to_string() }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = (*st.reload_tx.borrow()).clone();
    next.next();
    let seq = next.seq;
    let _ = st.reload_tx.send(next);
    (StatusCode::OK, Json(ReloadResponse { seq }))
}
