use serde_json::{json, Map, Value};

use super::{
    array_entry, insert_after_last_user, strip_text_items, WireFormat, COMPLETION_DIRECTIVE,
    CONTINUE_PROMPT,
};

const SYSTEM_INSTRUCTION: &str = "systemInstruction";
const LEGACY_SYSTEM_INSTRUCTION: &str = "system_instruction";

/// Gemini `generateContent` shape.
pub struct GeminiFormat;

impl GeminiFormat {
    /// Fold the legacy snake_case field into `systemInstruction`, legacy parts first.
    fn merge_legacy_instruction(request: &mut Map<String, Value>) {
        let Some(legacy) = request.remove(LEGACY_SYSTEM_INSTRUCTION) else {
            return;
        };
        match request.get_mut(SYSTEM_INSTRUCTION) {
            Some(canonical) => {
                let mut merged: Vec<Value> = legacy
                    .get("parts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if let Some(existing) = canonical.get("parts").and_then(Value::as_array) {
                    merged.extend(existing.iter().cloned());
                }
                if !canonical.is_object() {
                    *canonical = json!({});
                }
                canonical["parts"] = Value::Array(merged);
                tracing::debug!("merged system_instruction into systemInstruction");
            }
            None => {
                request.insert(SYSTEM_INSTRUCTION.to_string(), legacy);
            }
        }
    }
}

impl WireFormat for GeminiFormat {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn inject_directive(&self, request: &mut Map<String, Value>) {
        Self::merge_legacy_instruction(request);

        let instruction = request
            .entry(SYSTEM_INSTRUCTION)
            .or_insert_with(|| json!({ "parts": [] }));
        if !instruction.is_object() {
            *instruction = json!({ "parts": [] });
        }
        if let Value::Object(fields) = instruction {
            array_entry(fields, "parts").push(json!({ "text": COMPLETION_DIRECTIVE }));
        }
    }

    fn extract_text(&self, response: &Value) -> String {
        response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn strip_sentinel(&self, response: &mut Value) -> bool {
        match response.pointer_mut("/candidates/0/content/parts") {
            Some(Value::Array(parts)) => strip_text_items(parts),
            _ => false,
        }
    }

    fn insert_continuation_turns(&self, request: &mut Map<String, Value>, accumulated: &str) {
        let contents = array_entry(request, "contents");
        insert_after_last_user(
            contents,
            [
                json!({ "role": "model", "parts": [{ "text": accumulated }] }),
                json!({ "role": "user", "parts": [{ "text": CONTINUE_PROMPT }] }),
            ],
        );
    }

    /// Gemini has no done line; the last chunk carries `finishReason`.
    fn stream_terminated(&self, buffered: &str) -> bool {
        let mut saw_data = false;
        for line in buffered.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            saw_data = true;
            let finished = serde_json::from_str::<Value>(payload.trim())
                .ok()
                .and_then(|chunk| {
                    chunk
                        .pointer("/candidates/0/finishReason")
                        .map(|reason| reason.is_string())
                })
                .unwrap_or(false);
            if finished {
                return true;
            }
        }
        // Without alt=sse the stream is one JSON array spread over many chunks.
        !saw_data && buffered.contains("\"finishReason\"")
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
    fn inject_creates_system_instruction_when_absent() {
        let mut request = object(json!({
            "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }]
        }));
        GeminiFormat.inject_directive(&mut request);
        assert_eq!(
            request[SYSTEM_INSTRUCTION],
            json!({ "parts": [{ "text": COMPLETION_DIRECTIVE }] })
        );
    }

    #[test]
    fn inject_appends_part_to_existing_instruction() {
        let mut request = object(json!({
            "systemInstruction": { "parts": [{ "text": "Be brief." }] }
        }));
        GeminiFormat.inject_directive(&mut request);
        let parts = request[SYSTEM_INSTRUCTION]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "Be brief.");
        assert_eq!(parts[1]["text"], COMPLETION_DIRECTIVE);
    }

    #[test]
    fn inject_merges_legacy_field_before_canonical_parts() {
        let mut request = object(json!({
            "system_instruction": { "parts": [{ "text": "legacy" }] },
            "systemInstruction": { "parts": [{ "text": "canonical" }] }
        }));
        GeminiFormat.inject_directive(&mut request);
        assert!(!request.contains_key(LEGACY_SYSTEM_INSTRUCTION));
        let texts: Vec<&str> = request[SYSTEM_INSTRUCTION]["parts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["legacy", "canonical", COMPLETION_DIRECTIVE]);
    }

    #[test]
    fn inject_renames_lone_legacy_field() {
        let mut request = object(json!({
            "system_instruction": { "parts": [{ "text": "legacy" }] }
        }));
        GeminiFormat.inject_directive(&mut request);
        assert!(!request.contains_key(LEGACY_SYSTEM_INSTRUCTION));
        assert_eq!(request[SYSTEM_INSTRUCTION]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn extract_concatenates_parts_in_order() {
        let response = json!({ "candidates": [{ "content": { "role": "model", "parts": [
            { "text": "foo " }, { "functionCall": { "name": "f" } }, { "text": "bar" }
        ] } }] });
        assert_eq!(GeminiFormat.extract_text(&response), "foo bar");
        assert_eq!(GeminiFormat.extract_text(&json!({ "candidates": [] })), "");
    }

    #[test]
    fn strip_only_touches_last_text_part() {
        let mut response = json!({ "candidates": [{ "content": { "parts": [
            { "text": "foo " }, { "text": "bar [done]" }
        ] } }] });
        assert!(GeminiFormat.strip_sentinel(&mut response));
        assert_eq!(GeminiFormat.extract_text(&response), "foo bar");
    }

    #[test]
    fn continuation_turns_use_model_role_and_parts() {
        let mut request = object(json!({
            "contents": [
                { "role": "user", "parts": [{ "text": "tell a story" }] },
                { "role": "model", "parts": [{ "text": "Once" }] },
                { "role": "user", "parts": [{ "text": "go on" }] }
            ]
        }));
        GeminiFormat.insert_continuation_turns(&mut request, "upon a time");
        let contents = request["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 5);
        assert_eq!(contents[3]["role"], "model");
        assert_eq!(contents[3]["parts"][0]["text"], "upon a time");
        assert_eq!(contents[4]["parts"][0]["text"], CONTINUE_PROMPT);
    }

    #[test]
    fn stream_terminated_looks_for_finish_reason() {
        let complete = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let truncated = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}\n\n";
        assert!(GeminiFormat.stream_terminated(complete));
        assert!(!GeminiFormat.stream_terminated(truncated));
        assert!(GeminiFormat.stream_terminated("[{\"candidates\":[{\"finishReason\":\"STOP\"}]}]"));
    }
}
