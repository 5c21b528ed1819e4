use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const MAX_LOG_ENTRIES: usize = 20;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackendState {
    Disabled,
    Idle,
    Connecting,
    Ready,
    Unavailable,
}

/// Point-in-time view of one backend, suitable for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub state: BackendState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_updated_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub operations: Vec<String>,
    /// Newest first.
    #[serde(default)]
    pub recent_logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Mutable bookkeeping behind [`BackendStatus`].
#[derive(Debug)]
pub(crate) struct StatusTracker {
    state: BackendState,
    last_error: Option<String>,
    last_updated_ms: u64,
    last_latency_ms: Option<u64>,
    success_count: u64,
    error_count: u64,
    operations: Vec<String>,
    failed_at: Option<Instant>,
    logs: VecDeque<LogEntry>,
}

impl StatusTracker {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            state: if enabled {
                BackendState::Idle
            } else {
                BackendState::Disabled
            },
            last_error: None,
            last_updated_ms: now_millis(),
            last_latency_ms: None,
            success_count: 0,
            error_count: 0,
            operations: Vec::new(),
            failed_at: None,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    pub(crate) fn state(&self) -> BackendState {
        self.state
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn operations(&self) -> &[String] {
        &self.operations
    }

    /// True while an unavailable backend is still inside its back-off window.
    pub(crate) fn backing_off(&self, retry_after: Duration) -> bool {
        self.state == BackendState::Unavailable
            && self
                .failed_at
                .map_or(false, |at| at.elapsed() < retry_after)
    }

    pub(crate) fn connecting(&mut self) {
        if self.state != BackendState::Ready {
            self.state = BackendState::Connecting;
            self.last_updated_ms = now_millis();
        }
    }

    pub(crate) fn connected(&mut self, operations: Vec<String>) {
        if self.state != BackendState::Ready {
            self.push_log(
                LogLevel::Info,
                format!("connected with {} operations", operations.len()),
            );
        }
        self.state = BackendState::Ready;
        self.last_error = None;
        self.failed_at = None;
        self.operations = operations;
        self.last_updated_ms = now_millis();
    }

    pub(crate) fn unavailable(&mut self, reason: &str) {
        self.state = BackendState::Unavailable;
        self.last_error = Some(reason.to_string());
        self.failed_at = Some(Instant::now());
        self.error_count = self.error_count.saturating_add(1);
        self.last_updated_ms = now_millis();
        self.push_log(LogLevel::Warn, format!("unavailable: {}", reason.trim()));
    }

    pub(crate) fn record_success(&mut self, operation: &str, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.last_latency_ms = Some(latency_ms);
        self.success_count = self.success_count.saturating_add(1);
        self.last_updated_ms = now_millis();
        self.push_log(
            LogLevel::Info,
            format!("{operation} succeeded in {latency_ms} ms"),
        );
    }

    pub(crate) fn record_error(&mut self, operation: &str, error: &str) {
        self.last_error = Some(error.to_string());
        self.error_count = self.error_count.saturating_add(1);
        self.last_updated_ms = now_millis();
        self.push_log(LogLevel::Error, format!("{operation} failed: {}", error.trim()));
    }

    pub(crate) fn snapshot(&self) -> BackendStatus {
        BackendStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            last_updated_ms: self.last_updated_ms,
            last_latency_ms: self.last_latency_ms,
            success_count: self.success_count,
            error_count: self.error_count,
            operations: self.operations.clone(),
            recent_logs: self.logs.iter().rev().cloned().collect(),
        }
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if self.logs.len() == MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp_ms: now_millis(),
            level,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_keeps_the_newest_entries() {
        let mut tracker = StatusTracker::new(true);
        for i in 0..25 {
            tracker.record_error(&format!("op{i}"), "boom");
        }
        let status = tracker.snapshot();
        assert_eq!(status.recent_logs.len(), MAX_LOG_ENTRIES);
        assert!(status.recent_logs[0].message.starts_with("op24"));
        assert_eq!(status.error_count, 25);
    }

    #[test]
    fn unavailable_backs_off_until_window_passes() {
        let mut tracker = StatusTracker::new(true);
        assert_eq!(tracker.state(), BackendState::Idle);
        tracker.unavailable("connection refused");
        assert!(tracker.backing_off(Duration::from_secs(60)));
        assert!(!tracker.backing_off(Duration::ZERO));

        tracker.connected(vec!["execute_sql".into()]);
        assert_eq!(tracker.state(), BackendState::Ready);
        assert!(tracker.last_error().is_none());
        assert!(!tracker.backing_off(Duration::from_secs(60)));
    }

    #[test]
    fn reconnect_attempts_leave_a_ready_backend_ready() {
        let mut tracker = StatusTracker::new(true);
        tracker.connecting();
        assert_eq!(tracker.state(), BackendState::Connecting);
        tracker.connected(vec!["execute_sql".into()]);
        tracker.connecting();
        assert_eq!(tracker.state(), BackendState::Ready);
    }

    #[test]
    fn disabled_backends_start_disabled() {
        let tracker = StatusTracker::new(false);
        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["state"], "disabled");
        assert!(json.get("lastError").is_none());
    }
}
