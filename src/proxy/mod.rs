//! Request execution engine.
//!
//! [`ProxyEngine::handle`] owns one client request from normalisation to the
//! final log record: it applies parameter overrides and the completion
//! directive, then runs the retry loop. Each attempt takes a key from the
//! pool, dispatches to the group's channel, and classifies the result:
//!
//! - transport errors and HTTP statuses >= 400 (except 404) are recorded and
//!   retried with the same body;
//! - 2xx bodies are validated when advanced retry is on, and an invalid one
//!   is retried, with the partial text fed back as context if enabled;
//! - anything else is sent to the client, with the sentinel stripped.
//!
//! With advanced retry on, streams are held until they validate, so a
//! truncated stream can be retried without the client ever seeing it.
//! Without it they are relayed live.

pub mod attempt;
pub mod headers;
pub mod relay;
pub mod sink;

use std::{io, sync::Arc, time::Instant};

use axum::{
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use tokio_util::io::StreamReader;

use self::{
    attempt::{is_retryable_status, AttemptRecord},
    headers::{apply_header_rules, apply_stream_headers, forward_request_headers, response_headers, HeaderVars},
    relay::{relay, RelayMode},
    sink::ResponseSink,
};
use crate::{
    channel::ChannelProxy,
    config::{GroupConfig, SettingsProvider},
    continuation::{self, AccumulatedText},
    error::ProxyError,
    format::{self, FormatError, WireFormat},
    keys::{ApiKey, KeyProvider},
    traffic::{LogSink, RequestLogEntry},
    validate::{InvalidKind, PunctuationStreak, ResponseValidator, ValidationOutcome},
};

/// Status logged when the client went away before the response completed.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// A group with its channel, built once per config snapshot.
pub struct ResolvedGroup {
    pub name: String,
    pub config: GroupConfig,
    pub channel: Arc<dyn ChannelProxy>,
}

/// Client-facing facts about a request, for logging.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub group: String,
    /// Inbound path and query, as the client sent them.
    pub uri: String,
    pub client_ip: String,
    pub user_agent: String,
    pub started: Instant,
}

impl RequestMeta {
    fn entry(&self, status: u16) -> RequestLogEntry {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        RequestLogEntry::new(&self.group, status, elapsed)
            .with_id(&self.request_id)
            .with_client(&self.client_ip, &self.user_agent)
            .with_path(&self.uri)
    }
}

pub struct ProxyRequest {
    pub meta: RequestMeta,
    pub group: Arc<ResolvedGroup>,
    pub method: Method,
    /// Sub-path after the group prefix.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// State carried across the attempts of one request.
struct RetryContext {
    /// Attempts made so far.
    attempt: u32,
    records: Vec<AttemptRecord>,
    /// Normalised request, before any continuation.
    base_body: Bytes,
    /// Body for the next attempt.
    body: Bytes,
    accumulated: AccumulatedText,
    streak: PunctuationStreak,
}

impl RetryContext {
    fn new(body: Bytes, max_accumulated_chars: usize) -> Self {
        Self {
            attempt: 0,
            records: Vec::new(),
            base_body: body.clone(),
            body,
            accumulated: AccumulatedText::new(max_accumulated_chars),
            streak: PunctuationStreak::default(),
        }
    }

    fn record(&mut self, record: AttemptRecord) {
        self.records.push(record);
        self.attempt += 1;
    }

    /// Keep the partial text of `reply` and ask for the rest next time.
    fn continue_from(&mut self, reply: &[u8], format: &dyn WireFormat) {
        let partial = continuation::extract_partial_text(reply, format);
        if partial.trim().is_empty() {
            return;
        }
        self.accumulated.append(&partial);
        match continuation::build_continuation_request(&self.base_body, self.accumulated.as_str(), format) {
            Ok(body) => {
                tracing::debug!(
                    accumulated_chars = self.accumulated.len(),
                    "next attempt continues from partial output"
                );
                self.body = body;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to build continuation request; retrying original body");
                self.body = self.base_body.clone();
            }
        }
    }

    /// Streams restart from scratch: nothing partial is carried over.
    fn restart(&mut self) {
        self.accumulated.clear();
        self.body = self.base_body.clone();
    }
}

/// Executes proxied requests. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ProxyEngine {
    keys: Arc<dyn KeyProvider>,
    settings: Arc<dyn SettingsProvider>,
    log_sink: Arc<dyn LogSink>,
}

impl ProxyEngine {
    pub fn new(
        keys: Arc<dyn KeyProvider>,
        settings: Arc<dyn SettingsProvider>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            keys,
            settings,
            log_sink,
        }
    }

    /// Log a request that failed before reaching the engine, and render the error.
    pub fn reject(&self, meta: &RequestMeta, err: ProxyError) -> Response {
        tracing::warn!(request_id = %meta.request_id, group = %meta.group, error = %err, "request rejected");
        self.log_sink
            .record(meta.entry(err.status().as_u16()).with_error(&err.to_string()));
        err.into_response()
    }

    /// Run `req` to completion, answering through `sink`.
    #[tracing::instrument(
        name = "proxy",
        skip_all,
        fields(request_id = %req.meta.request_id, group = %req.group.name)
    )]
    pub async fn handle(&self, req: ProxyRequest, mut sink: ResponseSink) {
        let settings = self.settings.settings();
        let group = Arc::clone(&req.group);
        let channel = group.channel.as_ref();
        let format = format::for_channel(group.config.channel_type);

        let is_stream = channel.is_stream_request(&req.path, req.query.as_deref(), &req.headers, &req.body);
        let model = channel.extract_model(&req.path, &req.body);
        let model = model.as_deref();

        let body = match apply_param_overrides(&req.body, &group.config.param_overrides) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "parameter overrides not applicable to request body");
                let err = ProxyError::Internal("Failed to apply parameter overrides".into());
                self.log_sink.record(
                    req.meta
                        .entry(err.status().as_u16())
                        .with_retries(0, is_stream)
                        .with_model(model)
                        .with_error(&err.to_string()),
                );
                sink.respond_with(err);
                return;
            }
        };
        let body = if settings.enable_completion_check {
            format::inject_directive(&body, format).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "completion directive not injected; forwarding body as is");
                body
            })
        } else {
            body
        };

        let max_retries = group.config.effective_max_retries(&settings);
        let mut ctx = RetryContext::new(body, settings.max_accumulated_chars);

        loop {
            if ctx.attempt > max_retries {
                self.exhausted(&req.meta, &ctx, is_stream, model, sink);
                return;
            }
            // Re-read per attempt so a reload applies to the next try.
            let settings = self.settings.settings();
            let attempt_no = ctx.attempt + 1;

            let key = match self.keys.select_key(&group.name) {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(attempt = attempt_no, error = %e, "no usable key");
                    let err = ProxyError::NoKeysAvailable(e.to_string());
                    self.log_sink.record(
                        req.meta
                            .entry(err.status().as_u16())
                            .with_retries(ctx.attempt, is_stream)
                            .with_model(model)
                            .with_error(&err.to_string()),
                    );
                    sink.respond_with(err);
                    return;
                }
            };

            let url = match channel.build_upstream_url(&req.path, req.query.as_deref()) {
                Ok(url) => url,
                Err(e) => {
                    let err = ProxyError::Internal(format!("Failed to build upstream URL: {e:#}"));
                    self.fail(&req.meta, &ctx, is_stream, model, Some(&key), err, sink);
                    return;
                }
            };
            let upstream = url.to_string();

            let mut headers = forward_request_headers(&req.headers, is_stream);
            apply_header_rules(
                &mut headers,
                &group.config.header_rules,
                &HeaderVars {
                    client_ip: &req.meta.client_ip,
                    group: &group.name,
                    api_key: key.secret(),
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                },
            );
            if let Err(e) = channel.modify_request(&mut headers, &key) {
                let err = ProxyError::Internal(format!("Failed to prepare upstream request: {e:#}"));
                self.fail(&req.meta, &ctx, is_stream, model, Some(&key), err, sink);
                return;
            }

            tracing::debug!(
                attempt = attempt_no,
                max_retries,
                key = %key.masked(),
                upstream = %upstream,
                stream = is_stream,
                "dispatching upstream request"
            );
            let client = if is_stream {
                channel.stream_client()
            } else {
                channel.http_client()
            };
            let request = client
                .request(req.method.clone(), url)
                .headers(headers)
                .body(ctx.body.clone());

            // ---- Buffered ------------------------------------------------
            if !is_stream {
                let timeout = group.config.effective_timeout(&settings);
                let reply = match attempt::send_buffered(request, timeout, &mut sink).await {
                    Ok(reply) => reply,
                    Err(e) if e.is_ignorable() => {
                        self.client_gone(&req.meta, attempt_no, is_stream, model, &key, &upstream);
                        return;
                    }
                    Err(e) => {
                        self.keys.update_status(&key, &group.name, false);
                        tracing::warn!(attempt = attempt_no, max_retries, key = %key.masked(), error = %e, "upstream request failed");
                        ctx.record(AttemptRecord::transport(&e, key, attempt_no, upstream));
                        continue;
                    }
                };

                if is_retryable_status(reply.status) {
                    self.keys.update_status(&key, &group.name, false);
                    let record = AttemptRecord::http(reply.status, &reply.body, key, attempt_no, upstream);
                    tracing::warn!(
                        attempt = attempt_no,
                        max_retries,
                        status = %reply.status,
                        error = record.summary(),
                        "upstream returned an error status"
                    );
                    ctx.record(record);
                    continue;
                }

                if settings.enable_advanced_retry && reply.status.is_success() {
                    let validator = ResponseValidator::new(settings.enable_completion_check);
                    if let ValidationOutcome::Invalid(invalid) = validator.validate(&reply.body, format, false) {
                        if invalid.retryable
                            && !ctx.streak.check(&reply.body, format, settings.enable_punctuation_heuristic)
                        {
                            self.keys.update_status(&key, &group.name, false);
                            tracing::warn!(
                                attempt = attempt_no,
                                max_retries,
                                kind = %invalid.kind,
                                "200 OK reply failed validation"
                            );
                            if settings.enable_context_retry {
                                ctx.continue_from(&reply.body, format);
                            }
                            ctx.record(AttemptRecord::validation(&invalid, key, attempt_no, upstream));
                            continue;
                        }
                        tracing::info!(
                            kind = %invalid.kind,
                            "accepting reply after consecutive punctuated endings"
                        );
                    }
                }

                self.keys.update_status(&key, &group.name, true);
                let body = if settings.enable_completion_check {
                    format::remove_sentinel(reply.body, format)
                } else {
                    reply.body
                };
                sink.set_head(reply.status, response_headers(&reply.headers));
                if sink.write(body).await.is_err() {
                    self.client_gone(&req.meta, attempt_no, is_stream, model, &key, &upstream);
                    return;
                }
                self.log_sink.record(
                    req.meta
                        .entry(reply.status.as_u16())
                        .with_retries(attempt_no, is_stream)
                        .with_model(model)
                        .with_key(Some(key.masked()))
                        .with_upstream(Some(&upstream)),
                );
                sink.finish();
                return;
            }

            // ---- Streaming -----------------------------------------------
            let response = match attempt::send_streaming(request, &mut sink).await {
                Ok(response) => response,
                Err(e) if e.is_ignorable() => {
                    self.client_gone(&req.meta, attempt_no, is_stream, model, &key, &upstream);
                    return;
                }
                Err(e) => {
                    self.keys.update_status(&key, &group.name, false);
                    tracing::warn!(attempt = attempt_no, max_retries, key = %key.masked(), error = %e, "upstream stream request failed");
                    ctx.record(AttemptRecord::transport(&e, key, attempt_no, upstream));
                    continue;
                }
            };

            let status = response.status();
            if is_retryable_status(status) {
                let body = match attempt::read_error_body(response, &mut sink).await {
                    Ok(body) => body,
                    Err(_) => {
                        self.client_gone(&req.meta, attempt_no, is_stream, model, &key, &upstream);
                        return;
                    }
                };
                self.keys.update_status(&key, &group.name, false);
                let record = AttemptRecord::http(status, &body, key, attempt_no, upstream);
                tracing::warn!(
                    attempt = attempt_no,
                    max_retries,
                    %status,
                    error = record.summary(),
                    "upstream stream returned an error status"
                );
                ctx.record(record);
                continue;
            }

            let mut head = response_headers(response.headers());
            // Error bodies keep their own content type.
            if status.is_success() {
                apply_stream_headers(&mut head);
            }
            sink.set_head(status, head);

            let hold = settings.enable_advanced_retry && status.is_success();
            let mode = if hold { RelayMode::Hold } else { RelayMode::Live };
            let validator = hold.then(|| (ResponseValidator::new(settings.enable_completion_check), format));
            let upstream_body = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
            let result = relay(upstream_body, &mut sink, mode, validator).await;

            match result.outcome {
                ValidationOutcome::Valid => {
                    if !result.forwarded && sink.write(result.buffered).await.is_err() {
                        self.client_gone(&req.meta, attempt_no, is_stream, model, &key, &upstream);
                        return;
                    }
                    self.keys.update_status(&key, &group.name, true);
                    sink.finish();
                    self.log_sink.record(
                        req.meta
                            .entry(status.as_u16())
                            .with_retries(attempt_no, is_stream)
                            .with_model(model)
                            .with_key(Some(key.masked()))
                            .with_upstream(Some(&upstream)),
                    );
                    return;
                }
                ValidationOutcome::Invalid(invalid) if invalid.retryable && !result.forwarded => {
                    self.keys.update_status(&key, &group.name, false);
                    tracing::warn!(
                        attempt = attempt_no,
                        max_retries,
                        kind = %invalid.kind,
                        buffered = result.buffered.len(),
                        "stream failed validation"
                    );
                    ctx.restart();
                    ctx.record(AttemptRecord::validation(&invalid, key, attempt_no, upstream));
                    continue;
                }
                ValidationOutcome::Invalid(invalid) => {
                    // Bytes already reached the client, or the client is gone.
                    let logged = if invalid.kind == InvalidKind::StreamWriteError {
                        CLIENT_CLOSED_REQUEST
                    } else {
                        status.as_u16()
                    };
                    tracing::warn!(attempt = attempt_no, kind = %invalid.kind, "stream ended early; not retried");
                    sink.finish();
                    self.log_sink.record(
                        req.meta
                            .entry(logged)
                            .with_retries(attempt_no, is_stream)
                            .with_model(model)
                            .with_key(Some(key.masked()))
                            .with_upstream(Some(&upstream))
                            .with_error(&invalid.to_string()),
                    );
                    return;
                }
            }
        }
    }

    /// Every attempt failed: surface the last upstream error.
    fn exhausted(
        &self,
        meta: &RequestMeta,
        ctx: &RetryContext,
        is_stream: bool,
        model: Option<&str>,
        sink: ResponseSink,
    ) {
        let Some(last) = ctx.records.last() else {
            let err = ProxyError::MaxRetriesExceeded;
            self.log_sink.record(
                meta.entry(err.status().as_u16())
                    .with_retries(ctx.attempt, is_stream)
                    .with_model(model)
                    .with_error(&err.to_string()),
            );
            sink.respond_with(err);
            return;
        };

        tracing::error!(
            attempts = ctx.attempt,
            status = %last.status,
            error = last.summary(),
            "all upstream attempts failed"
        );
        self.log_sink.record(
            meta.entry(last.status.as_u16())
                .with_retries(ctx.attempt, is_stream)
                .with_model(model)
                .with_key(Some(last.key.masked()))
                .with_upstream(Some(&last.upstream))
                .with_error(last.summary()),
        );

        let upstream_json = matches!(
            serde_json::from_str::<Value>(&last.error_message),
            Ok(Value::Object(_))
        );
        if upstream_json {
            sink.respond_with((
                last.status,
                [(header::CONTENT_TYPE, "application/json")],
                last.error_message.clone(),
            ));
        } else {
            sink.respond_with(ProxyError::Upstream {
                status: last.status,
                message: last.error_message.clone(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        meta: &RequestMeta,
        ctx: &RetryContext,
        is_stream: bool,
        model: Option<&str>,
        key: Option<&ApiKey>,
        err: ProxyError,
        sink: ResponseSink,
    ) {
        tracing::error!(error = %err, "request failed");
        self.log_sink.record(
            meta.entry(err.status().as_u16())
                .with_retries(ctx.attempt + 1, is_stream)
                .with_model(model)
                .with_key(key.map(ApiKey::masked))
                .with_error(&err.to_string()),
        );
        sink.respond_with(err);
    }

    fn client_gone(
        &self,
        meta: &RequestMeta,
        attempt: u32,
        is_stream: bool,
        model: Option<&str>,
        key: &ApiKey,
        upstream: &str,
    ) {
        tracing::info!(attempt, "client disconnected; request abandoned");
        self.log_sink.record(
            meta.entry(CLIENT_CLOSED_REQUEST)
                .with_retries(attempt, is_stream)
                .with_model(model)
                .with_key(Some(key.masked()))
                .with_upstream(Some(upstream))
                .with_error("client disconnected"),
        );
    }
}

/// Force the group's top-level fields onto the request body.
fn apply_param_overrides(body: &Bytes, overrides: &Map<String, Value>) -> Result<Bytes, FormatError> {
    if overrides.is_empty() {
        return Ok(body.clone());
    }
    let mut request = format::parse_object(body)?;
    for (field, value) in overrides {
        request.insert(field.clone(), value.clone());
    }
    Ok(Bytes::from(serde_json::to_vec(&request)?))
}
