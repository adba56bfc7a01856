//! Classifies 200 OK upstream bodies as complete or not.
//!
//! Providers report truncation, safety blocks and empty generations inside a
//! successful HTTP response, so the status code alone says nothing. The
//! [`ResponseValidator`] inspects the parsed JSON body and returns a
//! [`ValidationOutcome`] the engine uses to decide whether to retry. Bodies
//! that are not JSON, or not shaped like a chat reply (embeddings, model
//! lists), have no generation to judge and pass.
//!
//! Checks run in a fixed order and the first match wins:
//!
//! 1. empty content (zero completion tokens, or a chat reply with no text and no tool call)
//! 2. blocked content (block reason, content filter, safety stop sequence)
//! 3. abnormal finish reason
//! 4. missing completion sentinel (only when the completion check is on)

use std::fmt;

use serde_json::Value;

use crate::format::{self, WireFormat, COMPLETION_SENTINEL};

/// Gemini spelling; OpenAI and Anthropic use the lowercase form.
const ABNORMAL_FINISH_REASONS: [&str; 7] = [
    "SAFETY",
    "RECITATION",
    "OTHER",
    "ERROR",
    "PROHIBITED_CONTENT",
    "SPII",
    "MALFORMED_FUNCTION_CALL",
];

const NORMAL_STOP_REASONS: [&str; 3] = ["stop", "STOP", "end_turn"];

const TERMINAL_PUNCTUATION: [char; 7] = ['。', '？', '！', '.', '!', '?', '…'];

/// Consecutive well-terminated replies needed before the heuristic accepts one.
pub const PUNCTUATION_STREAK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKind {
    EmptyContent,
    BlockedContent,
    AbnormalFinish,
    IncompleteMissingSentinel,
    StreamTruncated,
    /// Upstream read failed mid-relay.
    StreamError,
    /// Client write failed mid-relay.
    StreamWriteError,
}

impl fmt::Display for InvalidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmptyContent => "EMPTY_CONTENT",
            Self::BlockedContent => "BLOCKED_CONTENT",
            Self::AbnormalFinish => "ABNORMAL_FINISH",
            Self::IncompleteMissingSentinel => "INCOMPLETE_MISSING_SENTINEL",
            Self::StreamTruncated => "STREAM_TRUNCATED",
            Self::StreamError => "STREAM_ERROR",
            Self::StreamWriteError => "STREAM_WRITE_ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalid {
    pub kind: InvalidKind,
    pub retryable: bool,
    pub message: String,
}

impl Invalid {
    pub fn retryable(kind: InvalidKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(kind: InvalidKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for Invalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Invalid),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Stateless response classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator {
    /// Treat a normal stop without the sentinel as incomplete.
    require_sentinel: bool,
}

impl ResponseValidator {
    pub fn new(require_sentinel: bool) -> Self {
        Self { require_sentinel }
    }

    pub fn validate(&self, body: &[u8], format: &dyn WireFormat, is_stream: bool) -> ValidationOutcome {
        let outcome = if is_stream {
            Self::validate_stream(body, format)
        } else {
            self.validate_buffered(body, format)
        };
        if let ValidationOutcome::Invalid(invalid) = &outcome {
            tracing::debug!(
                format = format.name(),
                kind = %invalid.kind,
                stream = is_stream,
                "response failed validation"
            );
        }
        outcome
    }

    fn validate_buffered(&self, body: &[u8], format: &dyn WireFormat) -> ValidationOutcome {
        let Ok(response) = serde_json::from_slice::<Value>(body) else {
            tracing::debug!(len = body.len(), "response is not JSON; nothing to validate");
            return ValidationOutcome::Valid;
        };
        let text = format.extract_text(&response);

        if let Some(marker) = zero_token_marker(&response) {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::EmptyContent,
                format!("upstream reported {marker} = 0"),
            ));
        }
        // Embeddings, model lists and the like carry no generated text at all.
        if has_generation(&response) && text.trim().is_empty() && !has_tool_call(&response) {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::EmptyContent,
                "response contains no generated text",
            ));
        }

        if let Some(reason) = block_marker(&response, body) {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::BlockedContent,
                format!("response blocked: {reason}"),
            ));
        }

        let finish = finish_reason(&response);
        if let Some(reason) = finish.filter(|r| is_abnormal_finish(r)) {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::AbnormalFinish,
                format!("abnormal finish reason {reason}"),
            ));
        }

        if self.require_sentinel
            && finish.is_some_and(|r| NORMAL_STOP_REASONS.contains(&r))
            && !text.trim().is_empty()
            && !contains_sentinel(body)
        {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::IncompleteMissingSentinel,
                "normal stop without completion sentinel",
            ));
        }

        ValidationOutcome::Valid
    }

    fn validate_stream(body: &[u8], format: &dyn WireFormat) -> ValidationOutcome {
        let buffered = String::from_utf8_lossy(body);

        if !format.stream_terminated(&buffered) {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::StreamTruncated,
                "stream ended without a terminal marker",
            ));
        }

        let mut data_lines = buffered
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .peekable();
        let has_payload = if data_lines.peek().is_some() {
            data_lines.any(|payload| {
                !payload.is_empty() && payload != "[DONE]" && payload != COMPLETION_SENTINEL
            })
        } else {
            let trimmed = buffered.trim();
            !trimmed.is_empty() && trimmed != "[]"
        };
        if !has_payload {
            return ValidationOutcome::Invalid(Invalid::retryable(
                InvalidKind::EmptyContent,
                "stream carried no payload",
            ));
        }

        ValidationOutcome::Valid
    }
}

/// Per-request counter of consecutive replies ending in sentence punctuation.
///
/// Lives in the retry loop's context, never on a shared instance.
#[derive(Debug, Default)]
pub struct PunctuationStreak {
    count: u32,
}

impl PunctuationStreak {
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns `true` when this reply completes a streak of
    /// [`PUNCTUATION_STREAK_THRESHOLD`], resetting the streak.
    pub fn check(&mut self, body: &[u8], format: &dyn WireFormat, enabled: bool) -> bool {
        if !enabled {
            return false;
        }
        let text = format::strip_sentinel(&format::extract_text(body, format));
        if text.is_empty() {
            self.count = 0;
            return false;
        }
        if text.ends_with(TERMINAL_PUNCTUATION) {
            self.count += 1;
            if self.count >= PUNCTUATION_STREAK_THRESHOLD {
                self.count = 0;
                return true;
            }
            return false;
        }
        self.count = 0;
        false
    }
}

fn zero_token_marker(response: &Value) -> Option<&'static str> {
    [
        ("/usage/completion_tokens", "completion_tokens"),
        ("/usageMetadata/candidatesTokenCount", "candidatesTokenCount"),
        ("/usage/output_tokens", "output_tokens"),
    ]
    .into_iter()
    .find(|(pointer, _)| response.pointer(pointer).and_then(Value::as_u64) == Some(0))
    .map(|(_, marker)| marker)
}

/// Whether the body is shaped like a chat reply (OpenAI, Gemini or Anthropic).
fn has_generation(response: &Value) -> bool {
    response.pointer("/choices/0/message").is_some_and(Value::is_object)
        || response.pointer("/candidates/0/content").is_some_and(Value::is_object)
        || response.get("content").is_some_and(Value::is_array)
}

fn has_tool_call(response: &Value) -> bool {
    let openai = response
        .pointer("/choices/0/message/tool_calls")
        .and_then(Value::as_array)
        .is_some_and(|calls| !calls.is_empty())
        || response.pointer("/choices/0/message/function_call").is_some();
    let gemini = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .is_some_and(|parts| parts.iter().any(|p| p.get("functionCall").is_some()));
    let anthropic = response
        .get("content")
        .and_then(Value::as_array)
        .is_some_and(|blocks| {
            blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        });
    openai || gemini || anthropic
}

fn block_marker(response: &Value, body: &[u8]) -> Option<String> {
    if let Some(reason) = response.pointer("/promptFeedback/blockReason") {
        return Some(format!("blockReason {reason}"));
    }
    if response.pointer("/choices/0/finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Some("content_filter".into());
    }
    let stop_sequence =
        response.get("stop_reason").and_then(Value::as_str) == Some("stop_sequence");
    if stop_sequence && String::from_utf8_lossy(body).to_ascii_lowercase().contains("safety") {
        return Some("safety stop sequence".into());
    }
    None
}

fn finish_reason(response: &Value) -> Option<&str> {
    response
        .pointer("/candidates/0/finishReason")
        .or_else(|| response.pointer("/choices/0/finish_reason"))
        .or_else(|| response.get("stop_reason"))
        .and_then(Value::as_str)
}

fn is_abnormal_finish(reason: &str) -> bool {
    ABNORMAL_FINISH_REASONS
        .iter()
        .any(|abnormal| *abnormal == reason || abnormal.to_ascii_lowercase() == reason)
}

fn contains_sentinel(body: &[u8]) -> bool {
    body.windows(COMPLETION_SENTINEL.len())
        .any(|window| window == COMPLETION_SENTINEL.as_bytes())
}
