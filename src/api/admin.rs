//! Admin listener: operator-facing introspection.
//!
//! Served on its own port so it can be firewalled independently of the
//! client listener.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::health;
use crate::{error::AppError, state::AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/admin/traffic", get(traffic))
        .route("/admin/stats", get(stats))
        .route("/admin/keys", get(keys))
        .route("/admin/reload", post(reload))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N: newest first.
pub async fn traffic(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrafficQuery>,
) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    Json(json!({ "count": entries.len(), "entries": entries }))
}

/// GET /admin/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.traffic.stats().await;
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "groups": state.config().groups.len(),
        "traffic": stats,
    }))
}

/// GET /admin/keys: per-group key health, secrets masked.
pub async fn keys(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "groups": state.keys.health() }))
}

/// POST /admin/reload: re-read the config file now.
pub async fn reload(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    state.reload()?;
    let mut groups: Vec<String> = state.config().groups.keys().cloned().collect();
    groups.sort();
    Ok(Json(json!({ "status": "reloaded", "groups": groups })))
}
