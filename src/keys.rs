//! Per-group API key pool.
//!
//! Keys are handed out round-robin. Each key counts consecutive failures; once
//! the count reaches the blacklist threshold the key is skipped for the
//! cool-down period. After that it is offered again: a success clears it, a
//! failure sends it back for another cool-down. A reload clears every count.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::Config;

/// A credential value. `Debug` and [`masked`][Self::masked] never reveal it.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }

    /// First four and last four characters, for logs.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".into();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyPoolError {
    #[error("no API keys available for group `{0}`")]
    NoKeysAvailable(String),
    #[error("group `{0}` has no key pool")]
    UnknownGroup(String),
}

/// Credential selection and health feedback. Must be safe for concurrent use.
pub trait KeyProvider: Send + Sync {
    fn select_key(&self, group: &str) -> Result<ApiKey, KeyPoolError>;
    fn update_status(&self, key: &ApiKey, group: &str, success: bool);
}

struct KeyState {
    key: ApiKey,
    failures: AtomicU32,
    /// Set while the key is blacklisted.
    benched_at: Mutex<Option<Instant>>,
}

impl KeyState {
    fn benched_at(&self) -> Option<Instant> {
        *self.benched_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_benched_at(&self, at: Option<Instant>) {
        *self.benched_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

struct GroupKeys {
    keys: Vec<KeyState>,
    cursor: AtomicUsize,
}

/// In-memory [`KeyProvider`].
pub struct KeyPool {
    threshold: AtomicU32,
    cooldown_ms: AtomicU64,
    groups: DashMap<String, Arc<GroupKeys>>,
}

impl KeyPool {
    /// `threshold` of 0 disables blacklisting.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: AtomicU32::new(threshold),
            cooldown_ms: AtomicU64::new(duration_ms(cooldown)),
            groups: DashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let settings = &config.settings;
        let pool = Self::new(settings.blacklist_threshold, settings.blacklist_cooldown());
        pool.reload(config);
        pool
    }

    /// Replace every group's keys from `config`. Failure counts start over.
    pub fn reload(&self, config: &Config) {
        self.threshold
            .store(config.settings.blacklist_threshold, Ordering::Relaxed);
        self.cooldown_ms
            .store(duration_ms(config.settings.blacklist_cooldown()), Ordering::Relaxed);
        self.groups.retain(|name, _| config.groups.contains_key(name));
        for (name, group) in &config.groups {
            let keys = group.api_keys();
            if keys.is_empty() {
                tracing::warn!(group = %name, "no API keys resolved from environment");
            }
            self.insert_group(name, keys);
        }
    }

    pub fn insert_group(&self, group: &str, keys: Vec<String>) {
        let keys = keys
            .into_iter()
            .map(|k| KeyState {
                key: ApiKey::new(k),
                failures: AtomicU32::new(0),
                benched_at: Mutex::new(None),
            })
            .collect();
        self.groups.insert(
            group.to_string(),
            Arc::new(GroupKeys {
                keys,
                cursor: AtomicUsize::new(0),
            }),
        );
    }

    fn group(&self, group: &str) -> Option<Arc<GroupKeys>> {
        self.groups.get(group).map(|entry| Arc::clone(entry.value()))
    }

    fn blacklisted(&self, state: &KeyState) -> bool {
        let threshold = self.threshold.load(Ordering::Relaxed);
        threshold != 0 && state.failures.load(Ordering::Relaxed) >= threshold
    }

    /// Not blacklisted, or blacklisted long enough ago to be tried again.
    fn usable(&self, state: &KeyState) -> bool {
        if !self.blacklisted(state) {
            return true;
        }
        let cooldown = Duration::from_millis(self.cooldown_ms.load(Ordering::Relaxed));
        state
            .benched_at()
            .map_or(true, |at| at.elapsed() >= cooldown)
    }

    /// Key health snapshot for the admin API, groups sorted by name.
    pub fn health(&self) -> Vec<GroupKeyHealth> {
        let mut groups: Vec<GroupKeyHealth> = self
            .groups
            .iter()
            .map(|entry| GroupKeyHealth {
                group: entry.key().clone(),
                keys: entry
                    .value()
                    .keys
                    .iter()
                    .map(|state| KeyHealth {
                        key: state.key.masked(),
                        failures: state.failures.load(Ordering::Relaxed),
                        blacklisted: !self.usable(state),
                    })
                    .collect(),
            })
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));
        groups
    }
}

impl KeyProvider for KeyPool {
    fn select_key(&self, group: &str) -> Result<ApiKey, KeyPoolError> {
        let keys = self
            .group(group)
            .ok_or_else(|| KeyPoolError::UnknownGroup(group.to_string()))?;
        let len = keys.keys.len();
        if len == 0 {
            return Err(KeyPoolError::NoKeysAvailable(group.to_string()));
        }
        let start = keys.cursor.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| &keys.keys[(start + offset) % len])
            .find(|state| self.usable(state))
            .map(|state| state.key.clone())
            .ok_or_else(|| KeyPoolError::NoKeysAvailable(group.to_string()))
    }

    fn update_status(&self, key: &ApiKey, group: &str, success: bool) {
        let Some(keys) = self.group(group) else {
            return;
        };
        let Some(state) = keys.keys.iter().find(|state| state.key == *key) else {
            return;
        };
        if success {
            if self.blacklisted(state) {
                tracing::info!(group = %group, key = %key.masked(), "API key recovered");
            }
            state.failures.store(0, Ordering::Relaxed);
            state.set_benched_at(None);
            return;
        }
        let failures = state.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.blacklisted(state) {
            // Every failure while blacklisted restarts the cool-down.
            state.set_benched_at(Some(Instant::now()));
            tracing::warn!(
                group = %group,
                key = %key.masked(),
                failures,
                "API key blacklisted after consecutive failures"
            );
        } else {
            tracing::debug!(group = %group, key = %key.masked(), failures, "API key failure recorded");
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Serialize)]
pub struct GroupKeyHealth {
    pub group: String,
    pub keys: Vec<KeyHealth>,
}

#[derive(Debug, Serialize)]
pub struct KeyHealth {
    pub key: String,
    pub failures: u32,
    pub blacklisted: bool,
}
