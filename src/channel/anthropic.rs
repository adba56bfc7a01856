use anyhow::Context;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use super::{ChannelBase, ChannelProxy};
use crate::{config::ChannelType, keys::ApiKey};

const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API transport.
pub struct AnthropicChannel {
    base: ChannelBase,
}

impl AnthropicChannel {
    pub fn new(base: ChannelBase) -> Self {
        Self { base }
    }
}

impl ChannelProxy for AnthropicChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn modify_request(&self, headers: &mut HeaderMap, key: &ApiKey) -> anyhow::Result<()> {
        let value = HeaderValue::from_str(key.secret())
            .context("API key contains invalid x-api-key header characters")?;
        headers.insert(HeaderName::from_static("x-api-key"), value);
        // Clients may pin a newer version; only fill in a default.
        headers
            .entry(HeaderName::from_static("anthropic-version"))
            .or_insert(HeaderValue::from_static(DEFAULT_API_VERSION));
        Ok(())
    }
}
