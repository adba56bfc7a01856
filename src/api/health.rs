//! Liveness probe served on both listeners.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz`: always 200 with `{"status": "ok"}`.
///
/// Touches no shared state, so it answers even while upstreams are down.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
