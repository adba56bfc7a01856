//! HTTP error types.
//!
//! [`AppError`] wraps [`anyhow::Error`] for admin handlers: any fallible
//! operation can be propagated with `?` and renders as a 500 with a JSON body.
//!
//! [`ProxyError`] is what proxy clients see when a request terminates without
//! an upstream body to pass through. It carries its own status and a stable
//! machine-readable code:
//!
//! ```json
//! { "error": { "code": "NO_KEYS_AVAILABLE", "message": "..." } }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Longest raw upstream error text kept when no message can be parsed out.
const MAX_RAW_ERROR_CHARS: usize = 2048;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// A terminal, client-visible proxy failure.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    NoKeysAvailable(String),
    #[error("max retries exceeded")]
    MaxRetriesExceeded,
    #[error("{0}")]
    BadRequest(String),
    #[error("group `{0}` not found")]
    GroupNotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoKeysAvailable(_) | Self::MaxRetriesExceeded => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::GroupNotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => *status,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoKeysAvailable(_) => "NO_KEYS_AVAILABLE",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::GroupNotFound(_) => "GROUP_NOT_FOUND",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (self.status(), Json(body)).into_response()
    }
}

/// Human-readable summary of an upstream error body.
///
/// Understands the usual `{"error": {"message": ...}}` envelope, a bare
/// `{"error": "..."}` or `{"message": "..."}`, and Gemini's array form.
/// Anything else comes back as the raw text, truncated.
pub fn parse_upstream_error(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("error").filter(|e| e.is_string()))
            .or_else(|| value.get("message"))
            .or_else(|| value.pointer("/0/error/message"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return message.trim().to_string();
        }
    }
    let raw = String::from_utf8_lossy(body);
    let raw = raw.trim();
    match raw.char_indices().nth(MAX_RAW_ERROR_CHARS) {
        Some((cut, _)) => raw[..cut].to_string(),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // -----------------------------------------------------------------------
    // AppError
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn app_error_returns_500_with_json_error_body() {
        let err: AppError = anyhow::anyhow!("something went wrong").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "something went wrong");
    }

    #[tokio::test]
    async fn app_error_includes_context_chain() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let app_err: AppError = anyhow::Error::from(err).context("reloading config").into();
        let json = json_body(app_err.into_response()).await;
        let text = json["error"].as_str().unwrap();
        assert!(text.contains("reloading config") && text.contains("file missing"), "{text}");
    }

    // -----------------------------------------------------------------------
    // ProxyError
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn proxy_error_renders_code_and_message() {
        let response = ProxyError::NoKeysAvailable("no API keys available for group `x`".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["error"]["code"], "NO_KEYS_AVAILABLE");
        assert_eq!(json["error"]["message"], "no API keys available for group `x`");
    }

    #[test]
    fn status_and_code_table() {
        let cases = [
            (ProxyError::MaxRetriesExceeded, StatusCode::SERVICE_UNAVAILABLE, "MAX_RETRIES_EXCEEDED"),
            (ProxyError::BadRequest("b".into()), StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            (ProxyError::GroupNotFound("g".into()), StatusCode::NOT_FOUND, "GROUP_NOT_FOUND"),
            (ProxyError::Internal("i".into()), StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR"),
            (
                ProxyError::Upstream { status: StatusCode::BAD_GATEWAY, message: "u".into() },
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    // -----------------------------------------------------------------------
    // parse_upstream_error
    // -----------------------------------------------------------------------

    #[test]
    fn parses_common_error_envelopes() {
        assert_eq!(
            parse_upstream_error(br#"{"error":{"message":"Rate limit reached","type":"requests"}}"#),
            "Rate limit reached"
        );
        assert_eq!(parse_upstream_error(br#"{"error":"bad key"}"#), "bad key");
        assert_eq!(parse_upstream_error(br#"{"message":"overloaded"}"#), "overloaded");
        assert_eq!(
            parse_upstream_error(br#"[{"error":{"code":429,"message":"Resource exhausted"}}]"#),
            "Resource exhausted"
        );
    }

    #[test]
    fn falls_back_to_truncated_raw_text() {
        assert_eq!(parse_upstream_error(b"  Bad Gateway \n"), "Bad Gateway");
        let long = "x".repeat(5000);
        assert_eq!(parse_upstream_error(long.as_bytes()).len(), MAX_RAW_ERROR_CHARS);
    }
}
