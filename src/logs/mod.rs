//! C7 — Log Pipeline.
//!
//! Tail + buffer + fan-out + index, grounded on the teacher's
//! `environment::docker::power::attach_container` (tail loop shape) and
//! `events::bus::EventBus` (fan-out shape), generalized to the spec's
//! ring-buffer-plus-persisted-file-plus-filtered-subscription design.

pub mod index;
pub mod tail;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::Configuration;
use crate::events::EventBus;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_label(label: &str) -> Self {
        match label.to_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARN" => LogLevel::Warn,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub level: LogLevel,
    pub stream: StreamKind,
    pub message: String,
    pub container_name: String,
}

/// Scans the head of the message for `ERROR|WARN|INFO|DEBUG|TRACE`
/// (case-insensitive), defaulting to `info`. Spec section 4.7.
pub fn infer_level(message: &str) -> LogLevel {
    let head: String = message.chars().take(200).collect();
    let upper = head.to_uppercase();
    for (needle, level) in [
        ("ERROR", LogLevel::Error),
        ("WARN", LogLevel::Warn),
        ("DEBUG", LogLevel::Debug),
        ("TRACE", LogLevel::Trace),
        ("INFO", LogLevel::Info),
    ] {
        if upper.contains(needle) {
            return level;
        }
    }
    LogLevel::Info
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub stream: Option<StreamKind>,
    pub substring: Option<String>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub regex: Option<Regex>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(stream) = self.stream {
            if entry.stream != stream {
                return false;
            }
        }
        if let Some(ref needle) = self.substring {
            if !entry.message.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if entry.timestamp_ms < since {
                return false;
            }
        }
        if let Some(until) = self.until_ms {
            if entry.timestamp_ms > until {
                return false;
            }
        }
        if let Some(ref re) = self.regex {
            if !re.is_match(&entry.message) {
                return false;
            }
        }
        true
    }
}

/// Per-container ring buffer, default capacity 2,000; oldest entry evicted
/// on overflow.
pub struct RingBuffer {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_n(&self, n: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

pub struct Subscription {
    pub id: String,
    pub container_name: String,
    pub filter: LogFilter,
    pub sender: mpsc::Sender<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub last_delivered: RwLock<DateTime<Utc>>,
    pub sent: std::sync::atomic::AtomicU64,
    pub errors: std::sync::atomic::AtomicU64,
}

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;
const HISTORY_CHUNK_SIZE: usize = 10;
const HISTORY_CHUNK_GAP: Duration = Duration::from_millis(50);
const SUBSCRIPTION_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct LogPipeline {
    buffers: DashMap<String, RwLock<RingBuffer>>,
    subscriptions: DashMap<String, Arc<Subscription>>,
    logs_dir: PathBuf,
    capacity: usize,
    events: EventBus,
}

impl LogPipeline {
    pub fn new(config: &Configuration, events: EventBus) -> Self {
        Self {
            buffers: DashMap::new(),
            subscriptions: DashMap::new(),
            logs_dir: config.logs_dir(),
            capacity: config.logs.ring_buffer_capacity,
            events,
        }
    }

    fn buffer_for(&self, container_name: &str) -> dashmap::mapref::one::Ref<'_, String, RwLock<RingBuffer>> {
        self.buffers
            .entry(container_name.to_string())
            .or_insert_with(|| RwLock::new(RingBuffer::new(self.capacity)));
        self.buffers.get(container_name).unwrap()
    }

    /// Ingests one tailed line: buffers it, persists it to the day file, and
    /// fans it out to matching subscribers. Never blocks on a subscriber —
    /// a full subscriber queue terminates that subscription instead.
    pub fn ingest(&self, container_name: &str, stream: StreamKind, message: String) {
        let level = infer_level(&message);
        let entry = LogEntry {
            timestamp_ms: Utc::now().timestamp_millis(),
            level,
            stream,
            message,
            container_name: container_name.to_string(),
        };

        self.buffer_for(container_name).write().push(entry.clone());
        if let Err(e) = self.persist_line(container_name, &entry) {
            tracing::warn!(container = container_name, error = %e, "failed to persist log line");
        }

        self.events.publish(crate::events::Event::LogLine {
            container_id: container_name.to_string(),
            entry: entry.clone(),
        });

        let mut terminated = Vec::new();
        for sub in self.subscriptions.iter() {
            let sub = sub.value();
            if sub.container_name != container_name || !sub.filter.matches(&entry) {
                continue;
            }
            match sub.sender.try_send(entry.clone()) {
                Ok(()) => {
                    sub.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    *sub.last_delivered.write() = Utc::now();
                }
                Err(_) => {
                    sub.errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    terminated.push(sub.id.clone());
                }
            }
        }
        for id in terminated {
            self.subscriptions.remove(&id);
        }
    }

    fn day_file_path(container_name: &str, at: DateTime<Utc>) -> String {
        format!("{}/{}.log", container_name, at.format("%Y-%m-%d"))
    }

    fn persist_line(&self, container_name: &str, entry: &LogEntry) -> LogResult<()> {
        let at = DateTime::<Utc>::from_timestamp_millis(entry.timestamp_ms).unwrap_or_else(Utc::now);
        let rel = Self::day_file_path(container_name, at);
        let path = self.logs_dir.join(&rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let line = serde_json::to_string(entry).unwrap_or_default();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Registers a subscriber; if `include_history` is set, replays the
    /// last `history_lines` in chunks of 10 with a small gap.
    pub fn subscribe(
        &self,
        container_name: &str,
        filter: LogFilter,
        include_history: bool,
        history_lines: usize,
    ) -> (String, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = Uuid::new_v4().to_string();
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            container_name: container_name.to_string(),
            filter: filter.clone(),
            sender: tx.clone(),
            created_at: Utc::now(),
            last_delivered: RwLock::new(Utc::now()),
            sent: Default::default(),
            errors: Default::default(),
        });
        self.subscriptions.insert(id.clone(), subscription);

        if include_history {
            let history: Vec<LogEntry> = self
                .buffer_for(container_name)
                .read()
                .last_n(history_lines)
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect();
            tokio::spawn(async move {
                for chunk in history.chunks(HISTORY_CHUNK_SIZE) {
                    for entry in chunk {
                        if tx.send(entry.clone()).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(HISTORY_CHUNK_GAP).await;
                }
            });
        }

        (id, rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscriptions.remove(id);
    }

    /// Returns the last `n` buffered entries matching `filter`, without
    /// registering a subscription. Used by the SSE handler to send one
    /// `historical` burst ahead of a live-only subscription.
    pub fn history(&self, container_name: &str, filter: &LogFilter, n: usize) -> Vec<LogEntry> {
        self.buffer_for(container_name)
            .read()
            .last_n(n)
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect()
    }

    /// Drops subscriptions that have seen no successful delivery in over
    /// 5 minutes (spec section 3/5).
    pub fn sweep_inactive(&self) -> usize {
        let mut stale = Vec::new();
        for sub in self.subscriptions.iter() {
            let idle = Utc::now().signed_duration_since(*sub.value().last_delivered.read());
            if idle.num_seconds() as u64 > SUBSCRIPTION_INACTIVITY_TIMEOUT.as_secs() {
                stale.push(sub.key().clone());
            }
        }
        let count = stale.len();
        for id in stale {
            self.subscriptions.remove(&id);
        }
        count
    }

    pub fn buffer_len(&self, container_name: &str) -> usize {
        self.buffers
            .get(container_name)
            .map(|b| b.read().len())
            .unwrap_or(0)
    }

    pub fn subscription_error_count(&self, id: &str) -> u64 {
        self.subscriptions
            .get(id)
            .map(|s| s.errors.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (tempfile::TempDir, LogPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Configuration::default();
        config.data_directory = dir.path().to_path_buf();
        (dir, LogPipeline::new(&config, EventBus::new()))
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(LogEntry {
                timestamp_ms: i,
                level: LogLevel::Info,
                stream: StreamKind::Stdout,
                message: format!("line {i}"),
                container_name: "c".into(),
            });
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.all()[0].message, "line 2");
    }

    #[test]
    fn infer_level_defaults_info() {
        assert_eq!(infer_level("plain message"), LogLevel::Info);
        assert_eq!(infer_level("ERROR: boom"), LogLevel::Error);
        assert_eq!(infer_level("warn: careful"), LogLevel::Warn);
    }

    #[tokio::test]
    async fn fan_out_respects_filter() {
        let (_dir, pipeline) = pipeline();
        let (_id_a, mut rx_a) =
            pipeline.subscribe("c1", LogFilter { level: Some(LogLevel::Error), ..Default::default() }, false, 0);
        let (_id_b, mut rx_b) = pipeline.subscribe("c1", LogFilter::default(), false, 0);

        for i in 0..10 {
            let msg = if i % 3 == 0 { "ERROR boom".to_string() } else { "ok".to_string() };
            pipeline.ingest("c1", StreamKind::Stdout, msg);
        }

        let mut a_count = 0;
        while rx_a.try_recv().is_ok() {
            a_count += 1;
        }
        let mut b_count = 0;
        while rx_b.try_recv().is_ok() {
            b_count += 1;
        }
        assert_eq!(a_count, 4); // i = 0,3,6,9
        assert_eq!(b_count, 10);
    }
}
