use serde_json::{json, Map, Value};

use super::{
    array_entry, concat_text_items, insert_after_last_user, strip_text_items, WireFormat,
    COMPLETION_DIRECTIVE, CONTINUE_PROMPT,
};

/// Anthropic Messages API shape.
pub struct AnthropicFormat;

impl WireFormat for AnthropicFormat {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn inject_directive(&self, request: &mut Map<String, Value>) {
        match request.get_mut("system") {
            Some(Value::String(system)) if !system.is_empty() => {
                system.push_str("\n\n");
                system.push_str(COMPLETION_DIRECTIVE);
            }
            Some(Value::Array(blocks)) => {
                blocks.push(json!({ "type": "text", "text": COMPLETION_DIRECTIVE }));
            }
            _ => {
                request.insert("system".into(), Value::String(COMPLETION_DIRECTIVE.into()));
            }
        }
    }

    fn extract_text(&self, response: &Value) -> String {
        response
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| concat_text_items(blocks))
            .unwrap_or_default()
    }

    fn strip_sentinel(&self, response: &mut Value) -> bool {
        match response.get_mut("content") {
            Some(Value::Array(blocks)) => strip_text_items(blocks),
            _ => false,
        }
    }

    fn insert_continuation_turns(&self, request: &mut Map<String, Value>, accumulated: &str) {
        let messages = array_entry(request, "messages");
        insert_after_last_user(
            messages,
            [
                json!({ "role": "assistant", "content": [{ "type": "text", "text": accumulated }] }),
                json!({ "role": "user", "content": [{ "type": "text", "text": CONTINUE_PROMPT }] }),
            ],
        );
    }

    fn stream_terminated(&self, buffered: &str) -> bool {
        buffered.lines().any(|line| {
            let line = line.trim();
            line == "event: message_stop"
                || (line.starts_with("data:") && line.contains("\"type\":\"message_stop\""))
        })
    }
}
