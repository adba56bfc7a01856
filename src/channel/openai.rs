use anyhow::Context;
use axum::http::{header, HeaderMap, HeaderValue};

use super::{ChannelBase, ChannelProxy};
use crate::{config::ChannelType, keys::ApiKey};

/// OpenAI-compatible transport. Also carries `generic` groups.
pub struct OpenAIChannel {
    base: ChannelBase,
    channel_type: ChannelType,
}

impl OpenAIChannel {
    pub fn new(base: ChannelBase, channel_type: ChannelType) -> Self {
        Self { base, channel_type }
    }
}

impl ChannelProxy for OpenAIChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn modify_request(&self, headers: &mut HeaderMap, key: &ApiKey) -> anyhow::Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", key.secret()))
            .context("API key contains invalid Authorization header characters")?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}
