//! The client side of a proxied request.
//!
//! The engine runs on its own task and writes into a [`ResponseSink`]; the
//! axum handler awaits the [`Response`] the sink hands over. The status and
//! headers are committed once, at the first body write in streaming mode or
//! at [`finish`][ResponseSink::finish] in buffered mode; heads set after that
//! are ignored.
//!
//! Client disconnects surface here: the handler future (and with it the
//! response receiver) or the streaming body is dropped, and both
//! [`closed`][ResponseSink::closed] and subsequent writes report it.

use std::io;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

/// Chunks buffered between the engine and the client connection.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("client disconnected")]
    ClientGone,
    #[error("response already committed")]
    Committed,
}

pub struct ResponseSink {
    incremental: bool,
    status: StatusCode,
    headers: HeaderMap,
    buffer: BytesMut,
    respond: Option<oneshot::Sender<Response>>,
    body_tx: Option<mpsc::Sender<Result<Bytes, io::Error>>>,
}

impl ResponseSink {
    /// `incremental` sinks forward each write to the client as it happens.
    pub fn new(incremental: bool) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            incremental,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            buffer: BytesMut::new(),
            respond: Some(tx),
            body_tx: None,
        };
        (sink, rx)
    }

    /// Whether writes reach the client before [`finish`][Self::finish].
    pub fn supports_incremental(&self) -> bool {
        self.incremental
    }

    pub fn is_committed(&self) -> bool {
        self.respond.is_none()
    }

    pub fn set_head(&mut self, status: StatusCode, headers: HeaderMap) {
        if self.is_committed() {
            tracing::debug!(%status, "response already committed; head ignored");
            return;
        }
        self.status = status;
        self.headers = headers;
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if !self.incremental {
            if self.respond.as_ref().is_some_and(|tx| tx.is_closed()) {
                return Err(SinkError::ClientGone);
            }
            self.buffer.extend_from_slice(&chunk);
            return Ok(());
        }
        if self.body_tx.is_none() {
            self.commit_stream()?;
        }
        match &self.body_tx {
            Some(tx) => tx.send(Ok(chunk)).await.map_err(|_| SinkError::ClientGone),
            None => Err(SinkError::ClientGone),
        }
    }

    fn commit_stream(&mut self) -> Result<(), SinkError> {
        let respond = self.respond.take().ok_or(SinkError::Committed)?;
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(STREAM_CHANNEL_CAPACITY);
        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        respond.send(response).map_err(|_| SinkError::ClientGone)?;
        self.body_tx = Some(tx);
        Ok(())
    }

    /// Resolves once the client can no longer receive the response.
    pub async fn closed(&mut self) {
        if let Some(tx) = &self.body_tx {
            tx.closed().await;
        } else if let Some(respond) = &mut self.respond {
            respond.closed().await;
        } else {
            std::future::pending::<()>().await;
        }
    }

    /// Answer with `response` instead of the head and buffer. No-op once committed.
    pub fn respond_with(mut self, response: impl IntoResponse) {
        match self.respond.take() {
            Some(respond) => {
                let _ = respond.send(response.into_response());
            }
            None => tracing::debug!("response already committed; error response dropped"),
        }
    }

    /// Complete the response. Streaming bodies end when the sink is dropped.
    pub fn finish(mut self) {
        if let Some(respond) = self.respond.take() {
            let mut response = Response::new(Body::from(self.buffer.split().freeze()));
            *response.status_mut() = self.status;
            *response.headers_mut() = std::mem::take(&mut self.headers);
            let _ = respond.send(response);
        }
    }
}
