//! HTTP status endpoint: exposes the monitor session as JSON.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use regionscope_services::{MonitorSession, RangeSource, RegionLatency, RegistryStatus, Snapshot};

#[derive(Clone)]
pub struct StatusState {
    pub session: Arc<MonitorSession>,
}

// ── /status ──────────────────────────────────────────────────────────────────

async fn handle_status(State(state): State<StatusState>) -> Json<Snapshot> {
    Json(state.session.snapshot())
}

// ── /flows ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct FlowsResponse {
    pub flows: Vec<FlowInfo>,
}

#[derive(Serialize)]
pub struct FlowInfo {
    pub remote:         String,
    pub local_port:     u16,
    pub packets:        u64,
    pub bytes_received: u64,
    pub bytes_sent:     u64,
    pub age_secs:       u64,
    pub idle_secs:      u64,
}

async fn handle_flows(State(state): State<StatusState>) -> Json<FlowsResponse> {
    let flows = state
        .session
        .live_flows()
        .into_iter()
        .map(|f| FlowInfo {
            remote:         f.key.remote_endpoint().to_string(),
            local_port:     f.key.local_port,
            packets:        f.stats.packets,
            bytes_received: f.stats.bytes_received,
            bytes_sent:     f.stats.bytes_sent,
            age_secs:       f.stats.first_seen.elapsed().as_secs(),
            idle_secs:      f.stats.last_seen.elapsed().as_secs(),
        })
        .collect();

    Json(FlowsResponse { flows })
}

// ── /regions ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RegionsResponse {
    pub enabled: bool,
    pub regions: Vec<RegionLatency>,
}

async fn handle_regions(State(state): State<StatusState>) -> Json<RegionsResponse> {
    let regions = state.session.regions();
    Json(RegionsResponse {
        enabled: regions.is_some(),
        regions: regions.unwrap_or_default(),
    })
}

// ── /registry ─────────────────────────────────────────────────────────────────

async fn handle_registry(State(state): State<StatusState>) -> Json<RegistryStatus> {
    Json(state.session.registry().status().await)
}

// ── /registry/refresh ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RefreshResponse {
    pub source:  RangeSource,
    pub entries: usize,
}

async fn handle_registry_refresh(State(state): State<StatusState>) -> Json<RefreshResponse> {
    let registry = state.session.registry();
    let source = registry.refresh().await;
    let entries = registry.len().await;
    tracing::info!(?source, entries, "registry refreshed via CLI");
    Json(RefreshResponse { source, entries })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status",           get(handle_status))
        .route("/flows",            get(handle_flows))
        .route("/regions",          get(handle_regions))
        .route("/registry",         get(handle_registry))
        .route("/registry/refresh", post(handle_registry_refresh))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
