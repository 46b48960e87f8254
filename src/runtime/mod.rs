//! C5 — Container Runtime Adapter.
//!
//! A thin, retry/timeout-wrapped capability over the container daemon.
//! Grounded on the teacher's `environment::traits::ProcessEnvironment` for
//! the trait shape and `docker::service::DockerService` /
//! `environment::docker::*` for the bollard-backed implementation.

pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("daemon error: {0}")]
    Daemon(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub workspace_bind: MountSpec,
    pub network: String,
    pub memory_bytes: i64,
    pub cpu_cores: f64,
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl From<&str> for ObservedStatus {
    fn from(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "created" => ObservedStatus::Created,
            "running" => ObservedStatus::Running,
            "paused" => ObservedStatus::Paused,
            "restarting" => ObservedStatus::Restarting,
            "removing" => ObservedStatus::Removing,
            "exited" => ObservedStatus::Exited,
            "dead" => ObservedStatus::Dead,
            _ => ObservedStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inspection {
    pub id: String,
    pub status: ObservedStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ThrottlingStats {
    pub periods: u64,
    pub throttled_periods: u64,
    pub throttled_time_ns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RawStats {
    pub cpu_total_usage_ns: u64,
    pub system_cpu_usage_ns: u64,
    pub online_cpus: u64,
    pub throttling: ThrottlingStats,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_cache_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub pids: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A boxed stream of tailed log lines, one item per line.
pub type LogLineStream = std::pin::Pin<
    Box<dyn tokio_stream::Stream<Item = RuntimeResult<(LogStream, String)>> + Send>,
>;

/// Capability-level wrapper over the container daemon. Retry/timeout
/// policy for `ping` lives on the trait's default method; concrete
/// implementations only need to provide the raw daemon calls.
#[async_trait]
pub trait ContainerRuntimeAdapter: Send + Sync {
    async fn ping_once(&self) -> RuntimeResult<()>;

    /// Three attempts, exponential backoff (1s, 2s, 4s), 5s per-attempt
    /// timeout — spec section 4.5.
    async fn ping(&self) -> RuntimeResult<()> {
        let delays = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];
        let mut last_err = None;
        for (attempt, delay) in delays.iter().enumerate() {
            let attempt_result =
                tokio::time::timeout(Duration::from_secs(5), self.ping_once()).await;
            match attempt_result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(RuntimeError::Timeout),
            }
            if attempt + 1 < delays.len() {
                tokio::time::sleep(*delay).await;
            }
        }
        Err(last_err.unwrap_or(RuntimeError::Unavailable("ping exhausted".into())))
    }

    async fn ensure_network(&self, name: &str) -> RuntimeResult<()>;

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start(&self, id: &str) -> RuntimeResult<()>;
    async fn stop(&self, id: &str, grace_period_secs: u64) -> RuntimeResult<()>;
    async fn restart(&self, id: &str) -> RuntimeResult<()>;
    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()>;
    async fn inspect(&self, id: &str) -> RuntimeResult<Inspection>;
    async fn stats(&self, id: &str) -> RuntimeResult<RawStats>;
    async fn list_by_label(&self, label: &str) -> RuntimeResult<Vec<Inspection>>;
    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<String>;

    /// Follows stdout/stderr for `id` until the daemon closes the stream.
    /// Lines are pre-split on line boundaries with framing stripped — the
    /// tail task (`logs::tail`) only has to tag arrival time and infer
    /// level.
    async fn log_lines(&self, id: &str) -> RuntimeResult<LogLineStream>;

    /// Polls `inspect` until it reports `expected` or `timeout` elapses.
    async fn wait_for_status(
        &self,
        id: &str,
        expected: ObservedStatus,
        timeout: Duration,
    ) -> RuntimeResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inspection = self.inspect(id).await?;
            if inspection.status == expected {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Normalizes a workspace path for the host OS: POSIX `/mnt/<drive>/...`
/// form under WSL, native path elsewhere. Spec section 4.5.
pub fn normalize_workspace_path(path: &str) -> String {
    if std::env::var("WSL_DISTRO_NAME").is_err() {
        return path.to_string();
    }
    // crude drive-letter rewrite: C:\foo\bar -> /mnt/c/foo/bar
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        let drive = path.chars().next().unwrap().to_ascii_lowercase();
        let rest = path[2..].replace('\\', "/");
        format!("/mnt/{drive}{rest}")
    } else {
        path.replace('\\', "/")
    }
}

/// Fixed image map, spec section 4.5: `node|vite|python|php|static ->
/// debug-host/<type>:latest`.
pub fn image_for_stack(stack: crate::ports::Stack) -> String {
    use crate::ports::Stack::*;
    let tag = match stack {
        Node | Vite => "node",
        Python => "python",
        Php => "php",
        Static => "static",
        Go => "go",
        Rust => "rust",
        Java => "java",
        Ruby => "ruby",
        Dotnet => "dotnet",
    };
    format!("debug-host/{tag}:latest")
}

/// `debug-host-<projectId>-<epoch-ms>`, spec section 4.5.
pub fn container_name(project_id: &str) -> String {
    format!("debug-host-{}-{}", project_id, Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_path_unchanged_outside_wsl() {
        std::env::remove_var("WSL_DISTRO_NAME");
        assert_eq!(normalize_workspace_path("/home/user/app"), "/home/user/app");
    }

    #[test]
    fn image_map_matches_spec() {
        assert_eq!(image_for_stack(crate::ports::Stack::Node), "debug-host/node:latest");
        assert_eq!(image_for_stack(crate::ports::Stack::Php), "debug-host/php:latest");
    }

    #[test]
    fn container_name_has_prefix() {
        let name = container_name("proj_abc");
        assert!(name.starts_with("debug-host-proj_abc-"));
    }
}
