use serde_json::{Map, Value};

use super::{AnthropicFormat, GeminiFormat, OpenAIFormat, WireFormat};

/// Unknown provider: picks a concrete format from the body's keys.
pub struct GenericFormat;

impl GenericFormat {
    fn detect(request: &Map<String, Value>) -> Option<&'static dyn WireFormat> {
        if request.get("messages").is_some_and(Value::is_array) {
            Some(&OpenAIFormat)
        } else if request.get("contents").is_some_and(Value::is_array) {
            Some(&GeminiFormat)
        } else if request.get("system").is_some_and(Value::is_string) {
            Some(&AnthropicFormat)
        } else {
            None
        }
    }

    fn candidates() -> [&'static dyn WireFormat; 3] {
        [&OpenAIFormat, &AnthropicFormat, &GeminiFormat]
    }
}

impl WireFormat for GenericFormat {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn inject_directive(&self, request: &mut Map<String, Value>) {
        match Self::detect(request) {
            Some(format) => format.inject_directive(request),
            None => tracing::warn!("unrecognised request shape; completion directive not injected"),
        }
    }

    fn extract_text(&self, response: &Value) -> String {
        Self::candidates()
            .into_iter()
            .map(|format| format.extract_text(response))
            .find(|text| !text.is_empty())
            .unwrap_or_default()
    }

    fn strip_sentinel(&self, response: &mut Value) -> bool {
        Self::candidates()
            .into_iter()
            .any(|format| format.strip_sentinel(response))
    }

    fn insert_continuation_turns(&self, request: &mut Map<String, Value>, accumulated: &str) {
        match Self::detect(request) {
            Some(format) => format.insert_continuation_turns(request, accumulated),
            None => tracing::warn!("unrecognised request shape; continuation turns not inserted"),
        }
    }

    fn stream_terminated(&self, buffered: &str) -> bool {
        Self::candidates()
            .into_iter()
            .any(|format| format.stream_terminated(buffered))
    }
}
