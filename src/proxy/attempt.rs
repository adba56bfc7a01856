//! One upstream try: dispatch under the right budget, and its record.

use std::{error::Error as StdError, time::Duration};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use reqwest::RequestBuilder;

use super::sink::ResponseSink;
use crate::{error::parse_upstream_error, keys::ApiKey, validate::Invalid};

/// Outcome of a failed attempt, kept for the final error and the log.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub status: StatusCode,
    /// Raw upstream body or transport error text.
    pub error_message: String,
    pub parsed_error: Option<String>,
    pub key: ApiKey,
    /// 1-based.
    pub attempt: u32,
    pub upstream: String,
}

impl AttemptRecord {
    pub fn transport(err: &DispatchError, key: ApiKey, attempt: u32, upstream: String) -> Self {
        Self {
            status: err.status(),
            error_message: err.to_string(),
            parsed_error: None,
            key,
            attempt,
            upstream,
        }
    }

    pub fn http(status: StatusCode, body: &[u8], key: ApiKey, attempt: u32, upstream: String) -> Self {
        Self {
            status,
            error_message: String::from_utf8_lossy(body).into_owned(),
            parsed_error: Some(parse_upstream_error(body)),
            key,
            attempt,
            upstream,
        }
    }

    /// Validation failures surface as 500 with `KIND: message`.
    pub fn validation(invalid: &Invalid, key: ApiKey, attempt: u32, upstream: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_message: invalid.message.clone(),
            parsed_error: Some(invalid.to_string()),
            key,
            attempt,
            upstream,
        }
    }

    /// The parsed error when there is one, else the raw message.
    pub fn summary(&self) -> &str {
        self.parsed_error
            .as_deref()
            .filter(|parsed| !parsed.is_empty())
            .unwrap_or(&self.error_message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("client disconnected")]
    ClientGone,
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("{}", error_chain(.0))]
    Transport(#[from] reqwest::Error),
}

impl DispatchError {
    /// Client-side failures end the request without spending retries.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::ClientGone)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientGone => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// A fully read upstream response.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Send and read the whole body within `timeout`, abandoning the call if
/// the client goes away first.
pub async fn send_buffered(
    request: RequestBuilder,
    timeout: Duration,
    sink: &mut ResponseSink,
) -> Result<UpstreamReply, DispatchError> {
    let exchange = async {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>(UpstreamReply {
            status,
            headers,
            body,
        })
    };
    tokio::select! {
        result = tokio::time::timeout(timeout, exchange) => match result {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(DispatchError::Timeout(timeout)),
        },
        _ = sink.closed() => Err(DispatchError::ClientGone),
    }
}

/// Send and return once headers arrive. Bound only to the client.
pub async fn send_streaming(
    request: RequestBuilder,
    sink: &mut ResponseSink,
) -> Result<reqwest::Response, DispatchError> {
    tokio::select! {
        result = request.send() => Ok(result?),
        _ = sink.closed() => Err(DispatchError::ClientGone),
    }
}

/// Body of an error response from the streaming client.
pub async fn read_error_body(
    response: reqwest::Response,
    sink: &mut ResponseSink,
) -> Result<Bytes, DispatchError> {
    tokio::select! {
        body = response.bytes() => Ok(body.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "failed to read upstream error body");
            Bytes::from_static(b"Failed to read error body")
        })),
        _ = sink.closed() => Err(DispatchError::ClientGone),
    }
}

/// HTTP statuses that count as a failed attempt. 404 is passed through.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.as_u16() >= 400 && status != StatusCode::NOT_FOUND
}
