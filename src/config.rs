//! Configuration types for lm-relay.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. The file is re-read by the
//! hot-reload watcher in `main.rs`; the engine only ever sees a snapshot.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [settings]
//! enable_completion_check = true
//! enable_advanced_retry   = true
//! max_retries             = 3
//!
//! [groups.openai]
//! channel_type = "openai"
//! api_keys_env = ["OPENAI_KEYS"]
//! upstreams    = [{ url = "https://api.openai.com", weight = 1 }]
//! ```

use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which wire format a group's upstreams speak.
///
/// The channel type selects both the transport behaviour (auth header, stream
/// detection) and the [`crate::format::WireFormat`] used to inspect and
/// rewrite bodies.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// OpenAI `/v1/chat/completions` and compatible servers.
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    /// Google Gemini `generateContent` / `streamGenerateContent`.
    Gemini,
    /// Anthropic Messages API (`/v1/messages`).
    Anthropic,
    /// Unknown provider: the body shape is probed per request.
    Generic,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::Generic => "generic",
        })
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Process-wide behaviour switches, read once per request attempt.
    #[serde(default)]
    pub settings: SystemSettings,

    /// Named upstream groups. Clients address a group by name in the URL path.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        for (name, group) in &self.groups {
            anyhow::ensure!(
                !group.upstreams.is_empty(),
                "group `{name}` has no upstreams"
            );
            for upstream in &group.upstreams {
                let url = url::Url::parse(&upstream.url)
                    .with_context(|| format!("group `{name}` upstream `{}`", upstream.url))?;
                anyhow::ensure!(
                    matches!(url.scheme(), "http" | "https"),
                    "group `{name}` upstream `{}` must be http(s)",
                    upstream.url
                );
                anyhow::ensure!(
                    upstream.weight > 0,
                    "group `{name}` upstream `{}` has zero weight",
                    upstream.url
                );
            }
            anyhow::ensure!(
                !group.api_keys_env.is_empty(),
                "group `{name}` has no `api_keys_env` entries"
            );
            for rule in &group.header_rules {
                axum::http::HeaderName::from_bytes(rule.key.as_bytes()).with_context(|| {
                    format!("group `{name}` header rule key `{}` is not a valid header name", rule.key)
                })?;
            }
        }
        Ok(())
    }
}

/// Core listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client-facing proxy API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory traffic log (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
        }
    }
}

/// Behaviour switches for the request execution engine.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SystemSettings {
    /// Ask the model to end every reply with the completion sentinel, and strip
    /// it again before the body reaches the client.
    #[serde(default)]
    pub enable_completion_check: bool,

    /// Inspect 200 OK bodies and retry the ones that are empty, blocked,
    /// abnormally finished or (with the completion check) missing the sentinel.
    #[serde(default)]
    pub enable_advanced_retry: bool,

    /// Accept an otherwise-invalid reply after three consecutive replies that
    /// end in sentence punctuation.
    #[serde(default)]
    pub enable_punctuation_heuristic: bool,

    /// Feed partial output back to the model as context on retry.
    #[serde(default)]
    pub enable_context_retry: bool,

    /// Cap on accumulated continuation text, in characters. 0 disables the cap.
    #[serde(default)]
    pub max_accumulated_chars: usize,

    /// Retries after the first attempt (default: 3). Groups may override.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Budget for one non-streaming attempt in seconds (default: 600). Groups may override.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Consecutive failures after which a key is skipped by the pool (default: 3).
    /// 0 disables blacklisting.
    #[serde(default = "defaults::blacklist_threshold")]
    pub blacklist_threshold: u32,

    /// Seconds a blacklisted key sits out before it is tried again (default: 60).
    #[serde(default = "defaults::blacklist_cooldown_secs")]
    pub blacklist_cooldown_secs: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            enable_completion_check: false,
            enable_advanced_retry: false,
            enable_punctuation_heuristic: false,
            enable_context_retry: false,
            max_accumulated_chars: 0,
            max_retries: defaults::max_retries(),
            request_timeout_secs: defaults::request_timeout_secs(),
            blacklist_threshold: defaults::blacklist_threshold(),
            blacklist_cooldown_secs: defaults::blacklist_cooldown_secs(),
        }
    }
}

/// Source of the live [`SystemSettings`].
///
/// Implementations must return a consistent snapshot; the engine calls this
/// once per attempt so a hot reload takes effect on the next attempt.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> SystemSettings;
}

impl SystemSettings {
    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_cooldown_secs)
    }
}

impl SettingsProvider for SystemSettings {
    fn settings(&self) -> SystemSettings {
        self.clone()
    }
}

/// A named group of interchangeable upstreams sharing one key pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub channel_type: ChannelType,

    /// Upstream base URLs, selected by weighted round-robin.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Environment variables holding this group's API keys. A variable may
    /// hold several keys separated by commas or newlines.
    #[serde(default)]
    pub api_keys_env: Vec<String>,

    /// Overrides [`SystemSettings::max_retries`] for this group.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Overrides [`SystemSettings::request_timeout_secs`] for this group.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Top-level JSON fields forced onto every request body.
    #[serde(default)]
    pub param_overrides: Map<String, Value>,

    /// Header edits applied to every upstream request.
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
}

impl GroupConfig {
    pub fn effective_max_retries(&self, settings: &SystemSettings) -> u32 {
        self.max_retries.unwrap_or(settings.max_retries)
    }

    pub fn effective_timeout(&self, settings: &SystemSettings) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(settings.request_timeout_secs))
    }

    /// Resolve every configured key from the environment, skipping unset variables.
    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys_env
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .flat_map(|raw| {
                raw.split([',', '\n'])
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "defaults::weight")]
    pub weight: u32,
}

/// One header edit. `value` may reference `${CLIENT_IP}`, `${GROUP_NAME}`,
/// `${API_KEY}` and `${TIMESTAMP_MS}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub action: HeaderAction,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    #[default]
    Set,
    Remove,
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn max_retries() -> u32 { 3 }
    pub fn request_timeout_secs() -> u64 { 600 }
    pub fn blacklist_threshold() -> u32 { 3 }
    pub fn blacklist_cooldown_secs() -> u64 { 60 }
    pub fn weight() -> u32 { 1 }
}
