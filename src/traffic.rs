//! Request log: one record per client request, kept in memory for the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. Every record is also emitted as a
//! structured `tracing` event so it reaches whatever collector the process
//! log is shipped to.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Longest request path kept in a record.
const MAX_PATH_CHARS: usize = 500;

/// Accepts request records. Must not block the caller on durability.
pub trait LogSink: Send + Sync {
    fn record(&self, entry: RequestLogEntry);
}

/// Fixed-capacity ring-buffer of recent [`RequestLogEntry`] records.
///
/// [`record`][LogSink::record] uses a non-blocking `try_lock` so it never
/// delays request handling; under lock contention the entry is dropped from
/// the buffer (it is still logged through `tracing`).
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestLogEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<RequestLogEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_duration_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.duration_ms as f64).sum::<f64>() / total as f64
        };

        let mut group_counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter() {
            *group_counts.entry(entry.group.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count: entries.iter().filter(|e| !e.success).count(),
            retried_count: entries.iter().filter(|e| e.retries > 1).count(),
            stream_count: entries.iter().filter(|e| e.is_stream).count(),
            avg_duration_ms,
            group_counts,
        }
    }
}

impl LogSink for TrafficLog {
    fn record(&self, entry: RequestLogEntry) {
        tracing::info!(
            request_id = %entry.id,
            group = %entry.group,
            status = entry.status,
            success = entry.success,
            retries = entry.retries,
            stream = entry.is_stream,
            duration_ms = entry.duration_ms,
            model = entry.model.as_deref().unwrap_or("-"),
            key = entry.key.as_deref().unwrap_or("-"),
            error = entry.error.as_deref().unwrap_or(""),
            "request completed"
        );
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }
}

/// One completed client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    /// Request ID (from `X-Request-ID`, or a fresh UUID).
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub success: bool,
    pub client_ip: String,
    /// Status surfaced to the client; 499 when the client went away.
    pub status: u16,
    pub path: String,
    pub duration_ms: u64,
    pub user_agent: String,
    /// Upstream attempts made.
    pub retries: u32,
    pub is_stream: bool,
    pub upstream: Option<String>,
    pub model: Option<String>,
    /// Masked credential of the final attempt.
    pub key: Option<String>,
    pub error: Option<String>,
}

impl RequestLogEntry {
    pub fn new(group: &str, status: u16, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            group: group.to_string(),
            success: status < 400,
            client_ip: String::new(),
            status,
            path: String::new(),
            duration_ms,
            user_agent: String::new(),
            retries: 0,
            is_stream: false,
            upstream: None,
            model: None,
            key: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        if !id.is_empty() {
            self.id = id.to_string();
        }
        self
    }

    pub fn with_client(mut self, client_ip: &str, user_agent: &str) -> Self {
        self.client_ip = client_ip.to_string();
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = truncate_chars(path, MAX_PATH_CHARS);
        self
    }

    pub fn with_retries(mut self, retries: u32, is_stream: bool) -> Self {
        self.retries = retries;
        self.is_stream = is_stream;
        self
    }

    pub fn with_upstream(mut self, upstream: Option<&str>) -> Self {
        self.upstream = upstream.map(|u| truncate_chars(u, MAX_PATH_CHARS));
        self
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        self.model = model.map(str::to_string);
        self
    }

    pub fn with_key(mut self, masked: Option<String>) -> Self {
        self.key = masked;
        self
    }

    /// Attach an error description; the entry counts as failed.
    pub fn with_error(mut self, err: &str) -> Self {
        self.success = false;
        self.error = Some(err.to_string());
        self
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s.to_string(),
    }
}

/// Aggregate statistics derived from all buffered [`RequestLogEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    /// Requests that needed more than one upstream attempt.
    pub retried_count: usize,
    pub stream_count: usize,
    pub avg_duration_ms: f64,
    pub group_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(group: &str, duration_ms: u64) -> RequestLogEntry {
        RequestLogEntry::new(group, 200, duration_ms).with_retries(1, false)
    }

    // -----------------------------------------------------------------------
    // Basic record / read
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn record_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.record(make_entry("openai", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].group, "openai");
        assert_eq!(recent[0].duration_ms, 42);
        assert!(recent[0].success);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.record(make_entry("a", 1));
        log.record(make_entry("b", 2));
        log.record(make_entry("c", 3));

        let recent = log.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].group, "c");
        assert_eq!(recent[1].group, "b");
    }

    // -----------------------------------------------------------------------
    // Ring-buffer overflow
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        for group in ["oldest", "middle", "newest", "extra"] {
            log.record(make_entry(group, 1));
        }
        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.group == "oldest"));
        assert!(all.iter().any(|e| e.group == "extra"));
    }

    #[tokio::test]
    async fn zero_capacity_keeps_nothing() {
        let log = TrafficLog::new(0);
        log.record(make_entry("a", 1));
        assert!(log.recent(10).await.is_empty());
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stats_on_empty_log() {
        let stats = TrafficLog::new(10).stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_duration_ms, 0.0);
        assert!(stats.group_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_counts_errors_retries_and_groups() {
        let log = TrafficLog::new(10);
        log.record(make_entry("openai", 100));
        log.record(make_entry("openai", 200).with_retries(3, true));
        log.record(RequestLogEntry::new("gemini", 503, 300).with_error("no keys"));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.retried_count, 1);
        assert_eq!(stats.stream_count, 1);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.group_counts["openai"], 2);
    }

    // -----------------------------------------------------------------------
    // RequestLogEntry fields
    // -----------------------------------------------------------------------

    #[test]
    fn success_follows_status_and_error() {
        assert!(RequestLogEntry::new("g", 200, 0).success);
        assert!(!RequestLogEntry::new("g", 429, 0).success);
        assert!(!RequestLogEntry::new("g", 200, 0).with_error("boom").success);
    }

    #[test]
    fn request_id_overrides_generated_id() {
        let entry = RequestLogEntry::new("g", 200, 0).with_id("req-123");
        assert_eq!(entry.id, "req-123");
        let fresh = RequestLogEntry::new("g", 200, 0).with_id("");
        assert_ne!(fresh.id, "");
    }

    #[test]
    fn long_paths_are_truncated() {
        let path = format!("/proxy/g/{}", "é".repeat(600));
        let entry = RequestLogEntry::new("g", 200, 0).with_path(&path);
        assert_eq!(entry.path.chars().count(), MAX_PATH_CHARS);
    }
}
