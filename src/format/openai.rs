use serde_json::{json, Map, Value};

use super::{
    array_entry, concat_text_items, insert_after_last_user, strip_sentinel, strip_text_items,
    WireFormat, COMPLETION_DIRECTIVE, CONTINUE_PROMPT,
};

/// OpenAI chat-completions shape (also LM Studio, vLLM, OpenRouter, …).
pub struct OpenAIFormat;

impl WireFormat for OpenAIFormat {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn inject_directive(&self, request: &mut Map<String, Value>) {
        let Some(Value::Array(messages)) = request.get_mut("messages") else {
            tracing::debug!("openai request has no messages array; directive not injected");
            return;
        };

        let system = messages
            .iter_mut()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("system"));

        match system {
            Some(message) => match message.get_mut("content") {
                Some(Value::String(content)) => {
                    content.push_str("\n\n");
                    content.push_str(COMPLETION_DIRECTIVE);
                }
                Some(Value::Array(parts)) => {
                    parts.push(json!({ "type": "text", "text": COMPLETION_DIRECTIVE }));
                }
                _ => {
                    message["content"] = Value::String(COMPLETION_DIRECTIVE.to_string());
                }
            },
            None => {
                messages.insert(0, json!({ "role": "system", "content": COMPLETION_DIRECTIVE }));
            }
        }
    }

    fn extract_text(&self, response: &Value) -> String {
        match response.pointer("/choices/0/message/content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => concat_text_items(parts),
            _ => String::new(),
        }
    }

    fn strip_sentinel(&self, response: &mut Value) -> bool {
        match response.pointer_mut("/choices/0/message/content") {
            Some(Value::String(text)) => {
                let cleaned = strip_sentinel(text);
                let modified = cleaned != *text;
                *text = cleaned;
                modified
            }
            Some(Value::Array(parts)) => strip_text_items(parts),
            _ => false,
        }
    }

    fn insert_continuation_turns(&self, request: &mut Map<String, Value>, accumulated: &str) {
        let messages = array_entry(request, "messages");
        insert_after_last_user(
            messages,
            [
                json!({ "role": "assistant", "content": accumulated }),
                json!({ "role": "user", "content": CONTINUE_PROMPT }),
            ],
        );
    }

    fn stream_terminated(&self, buffered: &str) -> bool {
        buffered.lines().any(|line| {
            line.strip_prefix("data:")
                .is_some_and(|payload| payload.trim() == "[DONE]")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn inject_appends_to_existing_system_message() {
        let mut request = object(json!({
            "messages": [
                { "role": "system", "content": "You are terse." },
                { "role": "user", "content": "hi" }
            ]
        }));
        OpenAIFormat.inject_directive(&mut request);
        let system = request["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("You are terse.\n\n"));
        assert!(system.ends_with(COMPLETION_DIRECTIVE));
        assert_eq!(request["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn inject_pushes_text_part_onto_array_content() {
        let mut request = object(json!({
            "messages": [
                { "role": "system", "content": [{ "type": "text", "text": "Be kind." }] },
                { "role": "user", "content": "hi" }
            ]
        }));
        OpenAIFormat.inject_directive(&mut request);
        let parts = request["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["text"], COMPLETION_DIRECTIVE);
    }

    #[test]
    fn inject_prepends_system_message_when_absent() {
        let mut request = object(json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "hi" }]
        }));
        OpenAIFormat.inject_directive(&mut request);
        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], COMPLETION_DIRECTIVE);
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn inject_leaves_request_without_messages_untouched() {
        let mut request = object(json!({ "prompt": "legacy completion" }));
        let before = request.clone();
        OpenAIFormat.inject_directive(&mut request);
        assert_eq!(request, before);
    }

    #[test]
    fn extract_reads_string_and_part_content() {
        let plain = json!({ "choices": [{ "message": { "content": "Hello." } }] });
        assert_eq!(OpenAIFormat.extract_text(&plain), "Hello.");

        let parts = json!({ "choices": [{ "message": { "content": [
            { "type": "text", "text": "Hel" },
            { "type": "image_url", "image_url": { "url": "x" } },
            { "type": "text", "text": "lo." }
        ] } }] });
        assert_eq!(OpenAIFormat.extract_text(&parts), "Hello.");
    }

    #[test]
    fn extract_returns_empty_on_shape_mismatch() {
        assert_eq!(OpenAIFormat.extract_text(&json!({ "choices": [] })), "");
        assert_eq!(OpenAIFormat.extract_text(&json!({ "candidates": [] })), "");
        assert_eq!(
            OpenAIFormat.extract_text(&json!({ "choices": [{ "message": { "content": null } }] })),
            ""
        );
    }

    #[test]
    fn strip_reports_whether_anything_changed() {
        let mut with = json!({ "choices": [{ "message": { "content": "Hi. [done]" } }] });
        assert!(OpenAIFormat.strip_sentinel(&mut with));
        assert_eq!(with["choices"][0]["message"]["content"], "Hi.");

        let mut without = json!({ "choices": [{ "message": { "content": "Hi." } }] });
        assert!(!OpenAIFormat.strip_sentinel(&mut without));
    }

    #[test]
    fn continuation_turns_use_string_content() {
        let mut request = object(json!({
            "messages": [
                { "role": "system", "content": "sys" },
                { "role": "user", "content": "write a poem" }
            ]
        }));
        OpenAIFormat.insert_continuation_turns(&mut request, "Roses are red,");
        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2], json!({ "role": "assistant", "content": "Roses are red," }));
        assert_eq!(messages[3], json!({ "role": "user", "content": CONTINUE_PROMPT }));
    }

    #[test]
    fn continuation_creates_messages_array_when_missing() {
        let mut request = object(json!({ "model": "gpt-4o" }));
        OpenAIFormat.insert_continuation_turns(&mut request, "partial");
        assert_eq!(request["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn stream_terminated_requires_done_marker() {
        let complete = "data: {\"choices\":[]}\n\ndata: [DONE]\n\n";
        let truncated = "data: {\"choices\":[]}\n\n";
        assert!(OpenAIFormat.stream_terminated(complete));
        assert!(OpenAIFormat.stream_terminated("data:[DONE]\n"));
        assert!(!OpenAIFormat.stream_terminated(truncated));
    }
}
