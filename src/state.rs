//! Shared application state and the live configuration snapshot.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use anyhow::Context;

use crate::{
    channel,
    config::{Config, SettingsProvider, SystemSettings},
    keys::KeyPool,
    proxy::{ProxyEngine, ResolvedGroup},
    traffic::TrafficLog,
};

/// A config together with the channels built from it.
pub struct Snapshot {
    pub config: Arc<Config>,
    pub groups: HashMap<String, Arc<ResolvedGroup>>,
}

impl Snapshot {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let groups = config
            .groups
            .iter()
            .map(|(name, group)| {
                let channel = channel::build(name, group, &config.settings)
                    .with_context(|| format!("building channel for group `{name}`"))?;
                let resolved = ResolvedGroup {
                    name: name.clone(),
                    config: group.clone(),
                    channel,
                };
                Ok((name.clone(), Arc::new(resolved)))
            })
            .collect::<anyhow::Result<HashMap<_, _>>>()?;
        Ok(Self {
            config: Arc::new(config),
            groups,
        })
    }
}

/// Atomically swappable [`Snapshot`].
///
/// The lock is held only to clone the `Arc`, so readers never wait on a reload.
pub struct LiveConfig {
    current: RwLock<Arc<Snapshot>>,
}

impl LiveConfig {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

impl SettingsProvider for LiveConfig {
    fn settings(&self) -> SystemSettings {
        self.snapshot().config.settings.clone()
    }
}

/// State injected into every handler via [`axum::extract::State`].
pub struct AppState {
    pub live: Arc<LiveConfig>,
    pub keys: Arc<KeyPool>,
    /// Recent requests, exposed through the admin API.
    ///
    /// Sized once at startup; a reload does not resize it.
    pub traffic: Arc<TrafficLog>,
    pub engine: ProxyEngine,
    /// Watched by the hot-reload task and re-read by `POST /admin/reload`.
    pub config_path: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf) -> anyhow::Result<Self> {
        let traffic = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));
        let keys = Arc::new(KeyPool::from_config(&config));
        let live = Arc::new(LiveConfig::new(Snapshot::build(config)?));
        let engine = ProxyEngine::new(keys.clone(), live.clone(), traffic.clone());
        Ok(Self {
            live,
            keys,
            traffic,
            engine,
            config_path,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.live.snapshot().config)
    }

    pub fn group(&self, name: &str) -> Option<Arc<ResolvedGroup>> {
        self.live.snapshot().groups.get(name).cloned()
    }

    /// Re-read the config file and swap it in. On error the running config is kept.
    pub fn reload(&self) -> anyhow::Result<()> {
        let config = Config::load(&self.config_path)
            .with_context(|| format!("reloading {}", self.config_path.display()))?;
        self.apply(config)
    }

    /// Swap in `config`: new channels, and a key pool rebuilt from it.
    pub fn apply(&self, config: Config) -> anyhow::Result<()> {
        let snapshot = Snapshot::build(config)?;
        self.keys.reload(&snapshot.config);
        let groups = snapshot.groups.len();
        self.live.replace(snapshot);
        tracing::info!(groups, "configuration applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyProvider;

    fn config(toml: &str) -> Config {
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        config
    }

    const ONE_GROUP: &str = r#"
        [settings]
        max_retries = 2

        [groups.openai]
        channel_type = "openai"
        upstreams = [{ url = "http://127.0.0.1:1" }]
        api_keys_env = ["LMR_STATE_TEST_KEYS"]
    "#;

    #[test]
    fn snapshot_resolves_every_group() {
        unsafe { std::env::set_var("LMR_STATE_TEST_KEYS", "sk-aaaa-1111,sk-bbbb-2222") };
        let state = AppState::new(config(ONE_GROUP), PathBuf::from("unused.toml")).unwrap();

        let group = state.group("openai").unwrap();
        assert_eq!(group.name, "openai");
        assert!(state.group("missing").is_none());
        assert_eq!(state.live.settings().max_retries, 2);
        assert!(state.keys.select_key("openai").is_ok());
    }

    #[test]
    fn apply_swaps_groups_and_settings() {
        unsafe { std::env::set_var("LMR_STATE_TEST_KEYS_2", "sk-cccc-3333") };
        let state = AppState::new(config(ONE_GROUP), PathBuf::from("unused.toml")).unwrap();
        let before = state.group("openai").unwrap();

        state
            .apply(config(
                r#"
                [settings]
                enable_advanced_retry = true

                [groups.gemini]
                channel_type = "gemini"
                upstreams = [{ url = "https://generativelanguage.googleapis.com" }]
                api_keys_env = ["LMR_STATE_TEST_KEYS_2"]
                "#,
            ))
            .unwrap();

        assert!(state.group("openai").is_none());
        assert!(state.group("gemini").is_some());
        assert!(state.live.settings().enable_advanced_retry);
        assert!(state.keys.select_key("openai").is_err());
        assert_eq!(state.keys.select_key("gemini").unwrap().secret(), "sk-cccc-3333");
        // Requests already holding the old group keep a working snapshot.
        assert_eq!(before.name, "openai");
    }

    #[test]
    fn failed_reload_keeps_running_config() {
        let dir = std::env::temp_dir().join(format!("lmr-state-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, ONE_GROUP).unwrap();

        let state = AppState::new(Config::load(&path).unwrap(), path.clone()).unwrap();
        std::fs::write(&path, "[groups.broken]\nupstreams = []\napi_keys_env = [\"X\"]\n").unwrap();

        assert!(state.reload().is_err());
        assert!(state.group("openai").is_some());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
