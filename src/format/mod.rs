//! Provider wire-format adapters.
//!
//! The engine, validator and continuation logic never look at a provider's
//! JSON directly. They go through a [`WireFormat`], selected once per request
//! from the group's [`ChannelType`], which knows where each family keeps its
//! system prompt, its generated text and its conversation turns.
//!
//! | Concern | OpenAI | Gemini | Anthropic |
//! |---|---|---|---|
//! | System prompt | `role: "system"` message | `systemInstruction.parts` | top-level `system` |
//! | Generated text | `choices[0].message.content` | `candidates[0].content.parts[].text` | `content[].text` |
//! | Turn list | `messages` | `contents` | `messages` |
//! | Assistant role | `assistant` | `model` | `assistant` |
//!
//! The byte-level helpers in this module parse, delegate and re-serialise.
//! Parse failures are returned as [`FormatError`] so callers can fall back to
//! the unmodified body.

mod anthropic;
mod gemini;
mod generic;
mod openai;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::config::ChannelType;

pub use anthropic::AnthropicFormat;
pub use gemini::GeminiFormat;
pub use generic::GenericFormat;
pub use openai::OpenAIFormat;

/// Literal the model is asked to append to every reply.
pub const COMPLETION_SENTINEL: &str = "[done]";

/// System directive injected when the completion check is enabled.
pub const COMPLETION_DIRECTIVE: &str = "IMPORTANT: At the very end of your entire response, you must write the token [done] to signal completion. This is a mandatory technical requirement.";

/// User turn appended after the partial output on a continuation retry.
pub const CONTINUE_PROMPT: &str =
    "Continue exactly where you left off without any preamble or repetition.";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("parsing JSON body: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("request body is not a JSON object")]
    NotAnObject,
}

/// One provider family's view of request and response bodies.
pub trait WireFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Add [`COMPLETION_DIRECTIVE`] to the request's system-level instruction.
    fn inject_directive(&self, request: &mut Map<String, Value>);

    /// Generated text of the first choice/candidate. Empty on any shape mismatch.
    fn extract_text(&self, response: &Value) -> String;

    /// Strip the sentinel from every text item of the first choice/candidate.
    /// Returns `true` when the response was modified.
    fn strip_sentinel(&self, response: &mut Value) -> bool;

    /// Insert an assistant turn carrying `accumulated` and a user turn asking
    /// to continue, right after the last user turn.
    fn insert_continuation_turns(&self, request: &mut Map<String, Value>, accumulated: &str);

    /// Whether a fully buffered event stream carries this family's end marker.
    fn stream_terminated(&self, buffered: &str) -> bool;
}

/// The adapter for a group's channel type.
pub fn for_channel(channel: ChannelType) -> &'static dyn WireFormat {
    match channel {
        ChannelType::OpenAI => &OpenAIFormat,
        ChannelType::Gemini => &GeminiFormat,
        ChannelType::Anthropic => &AnthropicFormat,
        ChannelType::Generic => &GenericFormat,
    }
}

/// Inject the completion directive into a serialised request body.
pub fn inject_directive(body: &[u8], format: &dyn WireFormat) -> Result<Bytes, FormatError> {
    let mut request = parse_object(body)?;
    format.inject_directive(&mut request);
    Ok(Bytes::from(serde_json::to_vec(&request)?))
}

/// Generated text of a serialised response body. Empty when the body is not JSON.
pub fn extract_text(body: &[u8], format: &dyn WireFormat) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(response) => format.extract_text(&response),
        Err(e) => {
            tracing::debug!(error = %e, "response is not JSON; no text extracted");
            String::new()
        }
    }
}

/// Remove the sentinel from a serialised response body.
///
/// Returns the body untouched when it does not parse or carries no sentinel.
pub fn remove_sentinel(body: Bytes, format: &dyn WireFormat) -> Bytes {
    let Ok(mut response) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    if !format.strip_sentinel(&mut response) {
        return body;
    }
    match serde_json::to_vec(&response) {
        Ok(cleaned) => {
            tracing::debug!(
                before = body.len(),
                after = cleaned.len(),
                "removed completion sentinel from response"
            );
            Bytes::from(cleaned)
        }
        Err(_) => body,
    }
}

/// Trim whitespace, drop the trailing sentinel, trim again.
///
/// Repeated trailing sentinels are all removed so that applying this twice
/// gives the same result as applying it once.
pub fn strip_sentinel(text: &str) -> String {
    let mut cleaned = text.trim();
    while let Some(rest) = cleaned.strip_suffix(COMPLETION_SENTINEL) {
        cleaned = rest.trim();
    }
    cleaned.to_string()
}

pub(crate) fn parse_object(body: &[u8]) -> Result<Map<String, Value>, FormatError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(FormatError::NotAnObject),
    }
}

/// Splice `synthetic` into `turns` right after the last `role: "user"` entry,
/// or at the end when there is none.
pub(crate) fn insert_after_last_user(turns: &mut Vec<Value>, synthetic: [Value; 2]) {
    let last_user = turns
        .iter()
        .rposition(|turn| turn.get("role").and_then(Value::as_str) == Some("user"));
    match last_user {
        Some(idx) => {
            let at = idx + 1;
            turns.splice(at..at, synthetic);
            tracing::debug!(index = idx, "inserted continuation after last user turn");
        }
        None => {
            turns.extend(synthetic);
            tracing::debug!("no user turn; appended continuation at the end");
        }
    }
}

/// Get `key` as an array, replacing any non-array value with an empty one.
pub(crate) fn array_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Vec<Value> {
    let slot = map.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => items,
        _ => unreachable!("slot was just set to an array"),
    }
}

/// Concatenate the `text` of every item that is text-typed (or untyped).
pub(crate) fn concat_text_items(items: &[Value]) -> String {
    items
        .iter()
        .filter(|item| matches!(item.get("type").and_then(Value::as_str), None | Some("text")))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect()
}

/// Apply [`strip_sentinel`] to the last item carrying a string `text` field.
///
/// Earlier items keep their whitespace so that concatenated text is unchanged.
pub(crate) fn strip_text_items(items: &mut [Value]) -> bool {
    let last = items
        .iter_mut()
        .rev()
        .find_map(|item| match item.get_mut("text") {
            Some(Value::String(text)) => Some(text),
            _ => None,
        });
    match last {
        Some(text) => {
            let cleaned = strip_sentinel(text);
            let modified = cleaned != *text;
            *text = cleaned;
            modified
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // strip_sentinel
    // -----------------------------------------------------------------------

    #[test]
    fn strip_sentinel_removes_trailing_token_and_whitespace() {
        assert_eq!(strip_sentinel("  Hello world. [done]  \n"), "Hello world.");
        assert_eq!(strip_sentinel("Hello world.[done]"), "Hello world.");
    }

    #[test]
    fn strip_sentinel_keeps_token_that_is_not_trailing() {
        assert_eq!(
            strip_sentinel("Type [done] when finished, then stop."),
            "Type [done] when finished, then stop."
        );
    }

    #[test]
    fn strip_sentinel_is_idempotent() {
        for input in [
            "plain text",
            "text [done]",
            "text [done] [done]",
            "  [done]  ",
            "",
            "你好。[done]",
        ] {
            let once = strip_sentinel(input);
            assert_eq!(strip_sentinel(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn sentinel_round_trips_for_every_variant() {
        let generated = "The answer is 42.";
        for format in [
            for_channel(ChannelType::OpenAI),
            for_channel(ChannelType::Gemini),
            for_channel(ChannelType::Anthropic),
        ] {
            let with_sentinel = format!("{generated} {COMPLETION_SENTINEL}");
            assert_eq!(strip_sentinel(&with_sentinel), generated, "{}", format.name());
        }
    }

    // -----------------------------------------------------------------------
    // Byte-level helpers
    // -----------------------------------------------------------------------

    #[test]
    fn inject_directive_rejects_non_json() {
        let err = inject_directive(b"not json", for_channel(ChannelType::OpenAI)).unwrap_err();
        assert!(matches!(err, FormatError::Parse(_)));
    }

    #[test]
    fn inject_directive_rejects_non_object_json() {
        let err = inject_directive(b"[1, 2]", for_channel(ChannelType::OpenAI)).unwrap_err();
        assert!(matches!(err, FormatError::NotAnObject));
    }

    #[test]
    fn extract_text_returns_empty_for_non_json() {
        assert_eq!(extract_text(b"<html>", for_channel(ChannelType::Gemini)), "");
    }

    #[test]
    fn remove_sentinel_leaves_unparseable_body_untouched() {
        let body = Bytes::from_static(b"data: partial [done]");
        assert_eq!(remove_sentinel(body.clone(), &OpenAIFormat), body);
    }

    #[test]
    fn remove_sentinel_rewrites_openai_body() {
        let body = serde_json::to_vec(&json!({
            "choices": [{ "message": { "role": "assistant", "content": "Done here. [done]" } }]
        }))
        .unwrap();
        let cleaned = remove_sentinel(Bytes::from(body), &OpenAIFormat);
        let value: Value = serde_json::from_slice(&cleaned).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "Done here.");
    }

    // -----------------------------------------------------------------------
    // insert_after_last_user
    // -----------------------------------------------------------------------

    fn synthetic() -> [Value; 2] {
        [json!({ "role": "assistant", "x": 1 }), json!({ "role": "user", "x": 2 })]
    }

    #[test]
    fn insert_after_last_user_splices_in_the_middle() {
        let mut turns = vec![
            json!({ "role": "system" }),
            json!({ "role": "user", "n": 1 }),
            json!({ "role": "assistant" }),
            json!({ "role": "user", "n": 2 }),
            json!({ "role": "tool" }),
        ];
        insert_after_last_user(&mut turns, synthetic());
        assert_eq!(turns.len(), 7);
        assert_eq!(turns[3]["n"], 2);
        assert_eq!(turns[4]["x"], 1);
        assert_eq!(turns[5]["x"], 2);
        assert_eq!(turns[6]["role"], "tool");
    }

    #[test]
    fn insert_after_last_user_appends_without_user_turn() {
        let mut turns = vec![json!({ "role": "system" })];
        insert_after_last_user(&mut turns, synthetic());
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["x"], 1);
        assert_eq!(turns[2]["x"], 2);
    }
}
