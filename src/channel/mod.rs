//! Upstream transport per provider family.
//!
//! A [`ChannelProxy`] owns the HTTP clients and the weighted upstream list of
//! one group, and knows the provider's conventions for authentication, stream
//! detection and model naming. Channels are built once per config snapshot so
//! connection pools live as long as the group's configuration does.

mod anthropic;
mod gemini;
mod openai;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use axum::http::{header, HeaderMap};
use reqwest::Client;
use url::Url;

use crate::{
    config::{ChannelType, GroupConfig, SystemSettings},
    keys::ApiKey,
};

pub use anthropic::AnthropicChannel;
pub use gemini::GeminiChannel;
pub use openai::OpenAIChannel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Provider-specific upstream dispatch for one group.
pub trait ChannelProxy: Send + Sync {
    fn base(&self) -> &ChannelBase;

    fn channel_type(&self) -> ChannelType;

    /// Put the credential where this provider expects it.
    fn modify_request(&self, headers: &mut HeaderMap, key: &ApiKey) -> anyhow::Result<()>;

    fn http_client(&self) -> &Client {
        &self.base().http_client
    }

    fn stream_client(&self) -> &Client {
        &self.base().stream_client
    }

    /// Next upstream (weighted round-robin) joined with the inbound sub-path.
    /// A `key` query parameter is never forwarded.
    fn build_upstream_url(&self, path: &str, query: Option<&str>) -> anyhow::Result<Url> {
        self.base().build_upstream_url(path, query)
    }

    fn is_stream_request(&self, _path: &str, _query: Option<&str>, headers: &HeaderMap, body: &[u8]) -> bool {
        accepts_event_stream(headers) || body_requests_stream(body)
    }

    fn extract_model(&self, _path: &str, body: &[u8]) -> Option<String> {
        model_from_body(body)
    }
}

/// State every channel shares: clients and the weighted upstream list.
pub struct ChannelBase {
    group: String,
    http_client: Client,
    stream_client: Client,
    upstreams: Vec<WeightedUpstream>,
    /// Current weights for smooth weighted round-robin, one per upstream.
    current: Mutex<Vec<i64>>,
}

struct WeightedUpstream {
    url: Url,
    weight: i64,
}

impl ChannelBase {
    pub fn new(group: &str, config: &GroupConfig, settings: &SystemSettings) -> anyhow::Result<Self> {
        let upstreams = config
            .upstreams
            .iter()
            .map(|u| {
                Ok(WeightedUpstream {
                    url: Url::parse(&u.url).with_context(|| format!("parsing upstream `{}`", u.url))?,
                    weight: i64::from(u.weight.max(1)),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!upstreams.is_empty(), "group `{group}` has no upstreams");

        let http_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.effective_timeout(settings))
            .build()
            .context("building reqwest client")?;
        // No overall timeout: a stream lives as long as the client keeps reading.
        let stream_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building streaming reqwest client")?;

        Ok(Self {
            group: group.to_string(),
            http_client,
            stream_client,
            current: Mutex::new(vec![0; upstreams.len()]),
            upstreams,
        })
    }

    fn next_upstream(&self) -> &Url {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let total: i64 = self.upstreams.iter().map(|u| u.weight).sum();
        let mut best = 0;
        for (idx, upstream) in self.upstreams.iter().enumerate() {
            current[idx] += upstream.weight;
            if current[idx] > current[best] {
                best = idx;
            }
        }
        current[best] -= total;
        &self.upstreams[best].url
    }

    fn build_upstream_url(&self, path: &str, query: Option<&str>) -> anyhow::Result<Url> {
        let base = self.next_upstream();
        tracing::trace!(group = %self.group, upstream = %base, "selected upstream");
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined).with_context(|| format!("building upstream URL `{joined}`"))?;

        let pairs: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .filter(|(k, _)| *k != "key")
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        Ok(url)
    }
}

/// Build the channel for a group.
pub fn build(
    name: &str,
    config: &GroupConfig,
    settings: &SystemSettings,
) -> anyhow::Result<Arc<dyn ChannelProxy>> {
    let base = ChannelBase::new(name, config, settings)?;
    Ok(match config.channel_type {
        ChannelType::OpenAI => Arc::new(OpenAIChannel::new(base, ChannelType::OpenAI)),
        ChannelType::Generic => Arc::new(OpenAIChannel::new(base, ChannelType::Generic)),
        ChannelType::Gemini => Arc::new(GeminiChannel::new(base)),
        ChannelType::Anthropic => Arc::new(AnthropicChannel::new(base)),
    })
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn body_requests_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

fn model_from_body(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}
