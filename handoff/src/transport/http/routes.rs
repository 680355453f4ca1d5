//! HTTP route handlers for the master status and worker diagnostics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{Html, IntoResponse, Json},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::stats::{ForkStats, ForkStatsSnapshot, RequestStats};

const DASHBOARD_HTML: &str = include_str!("dashboard.html");
const DASHBOARD_ADDR_MARKER: &str = "##ListenAddr##";

async fn fork_stats(State(stats): State<Arc<ForkStats>>) -> Json<ForkStatsSnapshot> {
    Json(stats.snapshot())
}

/// Master status routes: `GET /stats`.
pub fn master_routes(stats: Arc<ForkStats>) -> Router {
    Router::new()
        .route("/stats", get(fork_stats))
        .with_state(stats)
}

#[derive(Clone)]
struct DiagnosticsState {
    stats: Arc<RequestStats>,
    addr: SocketAddr,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub code: u16,
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    addr: Option<String>,
}

async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { code: 200 })
}

async fn request_stats(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    // The dashboard may be served from another worker's address.
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(state.stats.snapshot()),
    )
}

async fn dashboard(
    State(state): State<DiagnosticsState>,
    Query(query): Query<DashboardQuery>,
) -> Html<String> {
    let addr = match query.addr {
        Some(addr) if !addr.is_empty() => addr,
        _ => state.addr.to_string(),
    };
    Html(DASHBOARD_HTML.replacen(DASHBOARD_ADDR_MARKER, &addr, 1))
}

/// Worker self-diagnostics routes: `GET /status`, `GET /stats`, `GET /stats.html`.
///
/// `addr` is the diagnostics address the dashboard polls by default.
pub fn worker_routes(stats: Arc<RequestStats>, addr: SocketAddr) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/stats", get(request_stats))
        .route("/stats.html", get(dashboard))
        .with_state(DiagnosticsState { stats, addr })
}
