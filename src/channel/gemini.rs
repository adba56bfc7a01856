use anyhow::Context;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use super::{accepts_event_stream, model_from_body, ChannelBase, ChannelProxy};
use crate::{config::ChannelType, keys::ApiKey};

/// Gemini `generateContent` transport.
pub struct GeminiChannel {
    base: ChannelBase,
}

impl GeminiChannel {
    pub fn new(base: ChannelBase) -> Self {
        Self { base }
    }
}

impl ChannelProxy for GeminiChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Gemini
    }

    fn modify_request(&self, headers: &mut HeaderMap, key: &ApiKey) -> anyhow::Result<()> {
        let value = HeaderValue::from_str(key.secret())
            .context("API key contains invalid x-goog-api-key header characters")?;
        headers.insert(HeaderName::from_static("x-goog-api-key"), value);
        Ok(())
    }

    fn is_stream_request(&self, path: &str, query: Option<&str>, headers: &HeaderMap, _body: &[u8]) -> bool {
        path.contains(":streamGenerateContent")
            || query.is_some_and(|q| {
                url::form_urlencoded::parse(q.as_bytes()).any(|(k, v)| k == "alt" && v == "sse")
            })
            || accepts_event_stream(headers)
    }

    /// `models/<name>:<method>` in the path, else the body's `model`.
    fn extract_model(&self, path: &str, body: &[u8]) -> Option<String> {
        path.split_once("models/")
            .and_then(|(_, rest)| rest.split_once(':'))
            .map(|(model, _)| model.to_string())
            .filter(|model| !model.is_empty() && !model.contains('/'))
            .or_else(|| model_from_body(body))
    }
}
