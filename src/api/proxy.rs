//! Client listener: `ANY /proxy/{group}/{*path}` hands the request to the engine.
//!
//! The engine runs on its own task and answers through a [`ResponseSink`];
//! this handler only awaits the response it hands over. If the client goes
//! away the handler future is dropped, which the engine observes through the
//! sink and abandons the upstream call.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, Version},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tracing::Instrument as _;
use uuid::Uuid;

use super::{health, request_id::RequestId};
use crate::{
    error::ProxyError,
    proxy::{sink::ResponseSink, ProxyRequest, RequestMeta},
    state::AppState,
};

/// Largest request body accepted from a client.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/proxy/{group}/{*path}", any(proxy))
        .with_state(state)
}

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path((group_name, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let meta = RequestMeta {
        request_id: parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        group: group_name.clone(),
        uri: parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string()),
        client_ip: client_ip(
            &parts.headers,
            parts.extensions.get::<ConnectInfo<SocketAddr>>(),
        ),
        user_agent: parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        started: Instant::now(),
    };

    let Some(group) = state.group(&group_name) else {
        return state.engine.reject(&meta, ProxyError::GroupNotFound(group_name));
    };
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return state
                .engine
                .reject(&meta, ProxyError::BadRequest(format!("failed to read request body: {e}")));
        }
    };

    let query = parts.uri.query().map(str::to_string);
    let is_stream = group
        .channel
        .is_stream_request(&path, query.as_deref(), &parts.headers, &body);
    // HTTP/1.0 has no chunked transfer; such clients get the stream in one piece.
    let incremental = is_stream && parts.version != Version::HTTP_10;
    if is_stream && !incremental {
        tracing::debug!(version = ?parts.version, "client cannot stream; buffering response");
    }

    let request = ProxyRequest {
        meta,
        group,
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        body,
    };
    let (sink, response) = ResponseSink::new(incremental);
    let engine = state.engine.clone();
    tokio::spawn(async move { engine.handle(request, sink).await }.in_current_span());

    match response.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("engine finished without answering");
            ProxyError::Internal("request ended without a response".into()).into_response()
        }
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };
    forwarded
        .or_else(real)
        .map(str::to_string)
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
