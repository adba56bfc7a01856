//! Copies an upstream event stream to the client while keeping a full copy.
//!
//! Every byte read from upstream goes through a [`TeeReader`] into the
//! buffered copy before anything else happens to it, so the copy handed to
//! the validator always contains what the client saw, in the same order.

use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::sink::ResponseSink;
use crate::{
    format::WireFormat,
    validate::{Invalid, InvalidKind, ResponseValidator, ValidationOutcome},
};

pub const RELAY_CHUNK_SIZE: usize = 4 * 1024;

/// What the relay does with each chunk besides buffering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Forward every chunk to the client as soon as it is read.
    Live,
    /// Only buffer; the caller writes the copy once it has been validated.
    Hold,
}

#[derive(Debug)]
pub struct RelayResult {
    /// Everything read from upstream, complete or partial.
    pub buffered: Bytes,
    pub outcome: ValidationOutcome,
    /// Whether bytes already reached the client.
    pub forwarded: bool,
}

/// [`AsyncRead`] adapter that copies every byte it yields.
pub struct TeeReader<R> {
    inner: R,
    copy: BytesMut,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            copy: BytesMut::new(),
        }
    }

    pub fn into_copy(self) -> Bytes {
        self.copy.freeze()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.copy.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Relay `upstream` into `sink`.
///
/// When the sink cannot deliver incrementally the body is read whole and
/// written once, and the result is reported valid without inspection.
/// Otherwise the full copy is validated at end of stream when a validator is
/// given.
pub async fn relay<R>(
    upstream: R,
    sink: &mut ResponseSink,
    mode: RelayMode,
    validator: Option<(ResponseValidator, &dyn WireFormat)>,
) -> RelayResult
where
    R: AsyncRead + Unpin,
{
    if !sink.supports_incremental() {
        return relay_whole(upstream, sink).await;
    }

    let mut tee = TeeReader::new(upstream);
    let mut chunk = vec![0u8; RELAY_CHUNK_SIZE];
    let mut forwarded = false;

    loop {
        let read = tokio::select! {
            read = tee.read(&mut chunk) => read,
            _ = sink.closed() => {
                return RelayResult {
                    buffered: tee.into_copy(),
                    outcome: client_gone("client disconnected during stream"),
                    forwarded,
                };
            }
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if mode == RelayMode::Live {
                    forwarded = true;
                    if let Err(e) = sink.write(Bytes::copy_from_slice(&chunk[..n])).await {
                        tracing::debug!(error = %e, "client write failed mid-stream");
                        return RelayResult {
                            buffered: tee.into_copy(),
                            outcome: client_gone(&e.to_string()),
                            forwarded,
                        };
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "upstream read failed mid-stream");
                return RelayResult {
                    buffered: tee.into_copy(),
                    outcome: ValidationOutcome::Invalid(Invalid::retryable(
                        InvalidKind::StreamError,
                        e.to_string(),
                    )),
                    forwarded,
                };
            }
        }
    }

    let buffered = tee.into_copy();
    let outcome = match validator {
        Some((validator, format)) => validator.validate(&buffered, format, true),
        None => ValidationOutcome::Valid,
    };
    RelayResult {
        buffered,
        outcome,
        forwarded,
    }
}

async fn relay_whole<R>(mut upstream: R, sink: &mut ResponseSink) -> RelayResult
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let read = tokio::select! {
        read = upstream.read_to_end(&mut body) => read,
        _ = sink.closed() => {
            return RelayResult {
                buffered: Bytes::from(body),
                outcome: client_gone("client disconnected during stream"),
                forwarded: false,
            };
        }
    };
    if let Err(e) = read {
        return RelayResult {
            buffered: Bytes::from(body),
            outcome: ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::StreamError,
                e.to_string(),
            )),
            forwarded: false,
        };
    }
    let buffered = Bytes::from(body);
    if let Err(e) = sink.write(buffered.clone()).await {
        return RelayResult {
            buffered,
            outcome: client_gone(&e.to_string()),
            forwarded: false,
        };
    }
    RelayResult {
        buffered,
        outcome: ValidationOutcome::Valid,
        forwarded: true,
    }
}

fn client_gone(message: &str) -> ValidationOutcome {
    ValidationOutcome::Invalid(Invalid::fatal(InvalidKind::StreamWriteError, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OpenAIFormat;
    use axum::body::to_bytes;
    use futures_util::stream;
    use tokio_util::io::StreamReader;

    const COMPLETE: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    #[tokio::test]
    async fn live_relay_forwards_exactly_what_it_buffers() {
        let upstream: Vec<u8> = COMPLETE.iter().copied().cycle().take(10 * RELAY_CHUNK_SIZE + 17).collect();
        let (mut sink, rx) = ResponseSink::new(true);
        let result = relay(&upstream[..], &mut sink, RelayMode::Live, None).await;
        drop(sink);

        assert!(result.outcome.is_valid());
        assert!(result.forwarded);
        assert_eq!(&result.buffered[..], &upstream[..]);
        let response = rx.await.unwrap();
        let client = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(client, result.buffered);
    }

    #[tokio::test]
    async fn held_relay_validates_without_forwarding() {
        let (mut sink, _rx) = ResponseSink::new(true);
        let validator = ResponseValidator::new(false);
        let result = relay(
            COMPLETE,
            &mut sink,
            RelayMode::Hold,
            Some((validator, &OpenAIFormat as &dyn WireFormat)),
        )
        .await;
        assert!(result.outcome.is_valid());
        assert!(!result.forwarded);
        assert!(!sink.is_committed());
        assert_eq!(&result.buffered[..], COMPLETE);
    }

    #[tokio::test]
    async fn truncated_stream_fails_validation() {
        let (mut sink, _rx) = ResponseSink::new(true);
        let truncated = &COMPLETE[..COMPLETE.len() - 16];
        let result = relay(
            truncated,
            &mut sink,
            RelayMode::Hold,
            Some((ResponseValidator::new(false), &OpenAIFormat as &dyn WireFormat)),
        )
        .await;
        match result.outcome {
            ValidationOutcome::Invalid(invalid) => {
                assert_eq!(invalid.kind, InvalidKind::StreamTruncated);
                assert!(invalid.retryable);
            }
            ValidationOutcome::Valid => panic!("truncated stream accepted"),
        }
    }

    #[tokio::test]
    async fn upstream_read_error_is_retryable_with_partial_buffer() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ];
        let upstream = StreamReader::new(stream::iter(chunks));
        let (mut sink, _rx) = ResponseSink::new(true);
        let result = relay(upstream, &mut sink, RelayMode::Live, None).await;

        assert_eq!(&result.buffered[..], b"data: {\"a\":1}\n\n");
        match result.outcome {
            ValidationOutcome::Invalid(invalid) => {
                assert_eq!(invalid.kind, InvalidKind::StreamError);
                assert!(invalid.retryable);
            }
            ValidationOutcome::Valid => panic!("read error reported as valid"),
        }
    }

    #[tokio::test]
    async fn client_write_error_is_not_retryable() {
        let (mut sink, rx) = ResponseSink::new(true);
        drop(rx);
        let result = relay(COMPLETE, &mut sink, RelayMode::Live, None).await;
        match result.outcome {
            ValidationOutcome::Invalid(invalid) => {
                assert_eq!(invalid.kind, InvalidKind::StreamWriteError);
                assert!(!invalid.retryable);
            }
            ValidationOutcome::Valid => panic!("write error reported as valid"),
        }
    }

    #[tokio::test]
    async fn degraded_sink_copies_whole_body_without_validation() {
        let (mut sink, rx) = ResponseSink::new(false);
        let garbage = b"data: no done marker\n\n";
        let result = relay(
            &garbage[..],
            &mut sink,
            RelayMode::Hold,
            Some((ResponseValidator::new(true), &OpenAIFormat as &dyn WireFormat)),
        )
        .await;
        assert!(result.outcome.is_valid());
        assert!(result.forwarded);
        sink.finish();

        let response = rx.await.unwrap();
        let client = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&client[..], garbage);
    }
}
