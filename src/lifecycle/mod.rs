//! C6 — Container Lifecycle Manager.
//!
//! Single source of truth for per-container state. Grounded on the
//! teacher's `server::manager::Manager` for the bounded-concurrency batch
//! pattern (`Arc<Semaphore>`) and on `environment::docker::power` for the
//! start/stop/wait-for-status sequencing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::{Configuration, RunMode};
use crate::detect::Detector;
use crate::events::{ContainerState, Event, EventBus};
use crate::ports::{PortRegistry, Stack};
use crate::projects::{ProjectRegistry, ProjectUpdate};
use crate::runtime::{
    container_name, image_for_stack, normalize_workspace_path, ContainerRuntimeAdapter,
    ContainerSpec, MountSpec, ObservedStatus, RuntimeError,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("start timed out")]
    StartTimeout,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Project(#[from] crate::projects::ProjectError),
    #[error(transparent)]
    Port(#[from] crate::ports::PortError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub stack: Stack,
    pub workspace_bind: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub state: ContainerState,
    pub last_health: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    ports: Arc<PortRegistry>,
    projects: Arc<ProjectRegistry>,
    detector: Detector,
    events: EventBus,
    records: DashMap<String, RwLock<ContainerRecord>>,
    network_name: String,
    mode: RunMode,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeAdapter>,
        ports: Arc<PortRegistry>,
        projects: Arc<ProjectRegistry>,
        events: EventBus,
        config: &Configuration,
    ) -> Self {
        Self {
            runtime,
            ports,
            projects,
            detector: Detector::new(),
            events,
            records: DashMap::new(),
            network_name: config.docker.network_name.clone(),
            mode: config.mode,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub async fn ensure_network(&self) -> LifecycleResult<()> {
        self.runtime.ensure_network(&self.network_name).await?;
        Ok(())
    }

    pub fn get_record(&self, id: &str) -> Option<ContainerRecord> {
        self.records.get(id).map(|r| r.read().clone())
    }

    pub fn record_for_project(&self, project_id: &str) -> Option<ContainerRecord> {
        self.records
            .iter()
            .map(|e| e.value().read().clone())
            .find(|r| r.project_id == project_id)
    }

    fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(record) = self.records.get(id) {
            let project_id = {
                let mut r = record.write();
                r.state = state;
                r.project_id.clone()
            };
            self.events.publish(Event::StateChange {
                container_id: id.to_string(),
                project_id,
                state,
                at: Utc::now(),
            });
        }
    }

    /// Validates the spec (non-empty id, supported stack, valid normalized
    /// path, port 1..=65535), calls C5.create, records a Container Record.
    /// No state beyond Created is entered here. Spec section 4.6.
    pub async fn create_container(
        &self,
        project_id: &str,
        stack: Stack,
        workspace: &Path,
        port: u16,
        env: HashMap<String, String>,
    ) -> LifecycleResult<String> {
        if project_id.is_empty() {
            return Err(LifecycleError::Validation("project id is empty".into()));
        }
        if port == 0 {
            return Err(LifecycleError::Validation("port must be 1..=65535".into()));
        }
        let workspace_str = workspace
            .to_str()
            .ok_or_else(|| LifecycleError::Validation("workspace path is not valid UTF-8".into()))?;
        let normalized = normalize_workspace_path(workspace_str);

        let mut labels = HashMap::new();
        labels.insert("debug-host".to_string(), "true".to_string());
        labels.insert("project-id".to_string(), project_id.to_string());
        labels.insert("container-type".to_string(), stack.as_str().to_string());
        labels.insert("created".to_string(), Utc::now().to_rfc3339());

        let name = container_name(project_id);
        let spec = ContainerSpec {
            name: name.clone(),
            image: image_for_stack(stack),
            env,
            labels,
            workspace_bind: MountSpec {
                source: normalized.clone(),
                target: "/app".to_string(),
                read_only: false,
            },
            network: self.network_name.clone(),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cores: 2.0,
            host_port: port,
            container_port: port,
        };

        let id = self.runtime.create(&spec).await?;
        let record = ContainerRecord {
            id: id.clone(),
            name,
            project_id: project_id.to_string(),
            stack,
            workspace_bind: normalized,
            port,
            created_at: Utc::now(),
            state: ContainerState::Created,
            last_health: None,
            healthy: true,
            exit_code: None,
        };
        self.records.insert(id.clone(), RwLock::new(record));
        Ok(id)
    }

    /// Starts via C5, waits for running (30s), then treats daemon-reported
    /// exits as an unsolicited Exited transition (health callback wiring,
    /// spec section 4.6).
    pub async fn start_container(&self, id: &str) -> LifecycleResult<()> {
        self.set_state(id, ContainerState::Starting);
        self.runtime.start(id).await?;
        let waited = self
            .runtime
            .wait_for_status(id, ObservedStatus::Running, Duration::from_secs(30))
            .await;
        match waited {
            Ok(()) => {
                self.set_state(id, ContainerState::Running);
                if let Some(record) = self.records.get(id) {
                    record.write().last_health = Some(Utc::now());
                }
                Ok(())
            }
            Err(RuntimeError::Timeout) => Err(LifecycleError::StartTimeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent: already-stopped is success. Daemon-404 is success (spec
    /// section 4.6/4.7: "daemon-404 on stop/remove is success").
    pub async fn stop_container(&self, id: &str, grace_secs: u64) -> LifecycleResult<()> {
        self.set_state(id, ContainerState::Stopping);
        self.runtime.stop(id, grace_secs).await?;
        match self
            .runtime
            .wait_for_status(id, ObservedStatus::Exited, Duration::from_secs(30))
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                self.set_state(id, ContainerState::Stopped);
                Ok(())
            }
            Err(RuntimeError::Timeout) => {
                warn!(container = id, "stop wait timed out, treating as non-fatal");
                self.set_state(id, ContainerState::Stopped);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop-then-start; on stop failure still attempts start and surfaces
    /// the combined outcome.
    pub async fn restart_container(&self, id: &str, grace_secs: u64) -> LifecycleResult<()> {
        let stop_result = self.stop_container(id, grace_secs).await;
        let start_result = self.start_container(id).await;
        match (stop_result, start_result) {
            (_, Ok(())) => Ok(()),
            (Err(stop_err), Err(_)) => Err(stop_err),
            (Ok(()), Err(start_err)) => Err(start_err),
        }
    }

    /// Stops (unless `force`), removes via C5, drops the record. Not-found
    /// is success.
    pub async fn remove_container(&self, id: &str, force: bool) -> LifecycleResult<()> {
        if !force {
            let _ = self.stop_container(id, 10).await;
        }
        self.runtime.remove(id, force).await?;
        self.records.remove(id);
        self.set_state(id, ContainerState::Removed);
        Ok(())
    }

    /// Fans requests out concurrently with bounded parallelism (default 4),
    /// 30-second overall budget; partial failure is reported, not thrown.
    pub async fn batch<F, Fut>(&self, ids: Vec<String>, op: F) -> Vec<BatchItemResult>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = LifecycleResult<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(4));
        let op = Arc::new(op);
        let mut handles = Vec::new();
        for id in ids {
            let permit = semaphore.clone();
            let op = op.clone();
            let id_clone = id.clone();
            handles.push((
                id,
                tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await;
                    let result = op(id_clone.clone()).await;
                    BatchItemResult {
                        id: id_clone,
                        success: result.is_ok(),
                        error: result.err().map(|e| e.to_string()),
                    }
                }),
            ));
        }

        // Shared deadline rather than one timeout around the whole join, so
        // a budget overrun reports a TIMEOUT result per still-running id
        // instead of discarding every result that had already come in.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let item = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(item)) => item,
                Ok(Err(e)) => BatchItemResult {
                    id,
                    success: false,
                    error: Some(format!("task panicked: {e}")),
                },
                Err(_) => BatchItemResult {
                    id,
                    success: false,
                    error: Some("batch budget exceeded before this item completed".into()),
                },
            };
            results.push(item);
        }
        results
    }

    /// Lists containers bearing `debug-host=true` whose state is `exited`
    /// and removes them; per-container errors are warnings.
    pub async fn cleanup_orphans(&self) -> LifecycleResult<usize> {
        let candidates = self.runtime.list_by_label("debug-host=true").await?;
        let mut removed = 0;
        for candidate in candidates {
            if candidate.status == ObservedStatus::Exited {
                match self.runtime.remove(&candidate.id, true).await {
                    Ok(()) => {
                        self.records.remove(&candidate.id);
                        removed += 1;
                    }
                    Err(e) => error!(container = %candidate.id, error = %e, "orphan cleanup failed"),
                }
            }
        }
        info!(removed, "orphan cleanup complete");
        Ok(removed)
    }

    /// Called when the daemon reports an exit while a container was
    /// believed Running. Flips the record to Exited, records the exit
    /// code, and stops watching it (spec section 4.6).
    pub fn on_daemon_exit(&self, id: &str, exit_code: Option<i64>) {
        if let Some(record) = self.records.get(id) {
            let mut r = record.write();
            r.state = ContainerState::Exited;
            r.exit_code = exit_code;
            r.last_health = Some(Utc::now());
        }
        self.set_state(id, ContainerState::Exited);
    }

    /// Polls every record believed to be Running and calls `on_daemon_exit`
    /// for any the runtime now reports as exited. This is what actually
    /// drives `on_daemon_exit` in a running daemon (spec section 4.6);
    /// `main` schedules it on an interval alongside the other background
    /// jobs.
    pub async fn reconcile_exits(&self) -> usize {
        let running: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.read().state == ContainerState::Running)
            .map(|r| r.key().clone())
            .collect();

        let mut flipped = 0;
        for id in running {
            match self.runtime.inspect(&id).await {
                Ok(inspection) if inspection.status == ObservedStatus::Exited => {
                    self.on_daemon_exit(&id, inspection.exit_code);
                    flipped += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(container = %id, error = %e, "exit reconciliation probe failed"),
            }
        }
        flipped
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub async fn update_project_container(
        &self,
        project_id: &str,
        container_id: Option<String>,
    ) -> LifecycleResult<()> {
        self.projects.update(
            project_id,
            ProjectUpdate {
                container_id: Some(container_id),
                ..Default::default()
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntimeAdapter, Inspection, RawStats, RuntimeResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRuntime {
        running: AtomicBool,
    }

    #[async_trait]
    impl ContainerRuntimeAdapter for FakeRuntime {
        async fn ping_once(&self) -> RuntimeResult<()> {
            Ok(())
        }
        async fn ensure_network(&self, _name: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn create(&self, _spec: &crate::runtime::ContainerSpec) -> RuntimeResult<String> {
            Ok("fake-id".to_string())
        }
        async fn start(&self, _id: &str) -> RuntimeResult<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self, _id: &str, _grace: u64) -> RuntimeResult<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn restart(&self, _id: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str, _force: bool) -> RuntimeResult<()> {
            Ok(())
        }
        async fn inspect(&self, _id: &str) -> RuntimeResult<Inspection> {
            Ok(Inspection {
                id: "fake-id".into(),
                status: if self.running.load(Ordering::SeqCst) {
                    ObservedStatus::Running
                } else {
                    ObservedStatus::Exited
                },
                started_at: None,
                exit_code: None,
            })
        }
        async fn stats(&self, _id: &str) -> RuntimeResult<RawStats> {
            Ok(RawStats::default())
        }
        async fn list_by_label(&self, _label: &str) -> RuntimeResult<Vec<Inspection>> {
            Ok(vec![])
        }
        async fn exec(&self, _id: &str, _argv: &[String]) -> RuntimeResult<String> {
            Ok(String::new())
        }
        async fn log_lines(&self, _id: &str) -> RuntimeResult<crate::runtime::LogLineStream> {
            Ok(Box::pin(tokio_stream::empty()))
        }
    }

    fn manager() -> (tempfile::TempDir, LifecycleManager) {
        let dir = tempfile::tempdir().unwrap();
        let ports = Arc::new(PortRegistry::load(dir.path()).unwrap());
        let projects = Arc::new(ProjectRegistry::load(dir.path()).unwrap());
        let runtime: Arc<dyn ContainerRuntimeAdapter> = Arc::new(FakeRuntime {
            running: AtomicBool::new(false),
        });
        let config = Configuration::default();
        let manager = LifecycleManager::new(runtime, ports, projects, EventBus::new(), &config);
        (dir, manager)
    }

    #[tokio::test]
    async fn create_start_stop_cycle() {
        let (dir, manager) = manager();
        let id = manager
            .create_container(
                "proj_1",
                Stack::Node,
                dir.path(),
                3000,
                Default::default(),
            )
            .await
            .unwrap();
        manager.start_container(&id).await.unwrap();
        assert_eq!(
            manager.get_record(&id).unwrap().state,
            ContainerState::Running
        );
        manager.stop_container(&id, 1).await.unwrap();
        assert_eq!(
            manager.get_record(&id).unwrap().state,
            ContainerState::Stopped
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (dir, manager) = manager();
        let id = manager
            .create_container("proj_1", Stack::Node, dir.path(), 3000, Default::default())
            .await
            .unwrap();
        manager.stop_container(&id, 1).await.unwrap();
        manager.stop_container(&id, 1).await.unwrap();
    }
}
