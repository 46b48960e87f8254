//! Concrete health probes for the seven named components (spec section
//! 4.9): container daemon, port registry, project registry, tech stack
//! detector, control plane, file system, network.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{ErrorKind, HealthProbe, HealthState, ProbeResult};
use crate::detect::Detector;
use crate::ports::PortRegistry;
use crate::projects::ProjectRegistry;
use crate::runtime::ContainerRuntimeAdapter;

pub struct DaemonProbe {
    runtime: Arc<dyn ContainerRuntimeAdapter>,
}

impl DaemonProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntimeAdapter>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl HealthProbe for DaemonProbe {
    fn name(&self) -> &'static str {
        "daemon"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        match self.runtime.ping_once().await {
            Ok(()) => ProbeResult::healthy(started.elapsed().as_millis() as u64),
            Err(e) => ProbeResult::unhealthy(
                HealthState::Critical,
                started.elapsed().as_millis() as u64,
                ErrorKind::Daemon,
                &e.to_string(),
            ),
        }
    }
}

pub struct PortRegistryProbe {
    ports: Arc<PortRegistry>,
}

impl PortRegistryProbe {
    pub fn new(ports: Arc<PortRegistry>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl HealthProbe for PortRegistryProbe {
    fn name(&self) -> &'static str {
        "port_registry"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        let stats = self.ports.stats();
        let elapsed = started.elapsed().as_millis() as u64;
        let exhausted = stats.bands.iter().any(|b| b.allocated >= b.total);
        if exhausted {
            ProbeResult::unhealthy(HealthState::Warning, elapsed, ErrorKind::Port, "a port band is exhausted")
        } else {
            ProbeResult::healthy(elapsed)
        }
    }
}

pub struct ProjectRegistryProbe {
    projects: Arc<ProjectRegistry>,
}

impl ProjectRegistryProbe {
    pub fn new(projects: Arc<ProjectRegistry>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl HealthProbe for ProjectRegistryProbe {
    fn name(&self) -> &'static str {
        "project_registry"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        let _ = self.projects.list();
        ProbeResult::healthy(started.elapsed().as_millis() as u64)
    }
}

pub struct DetectorProbe {
    detector: Arc<Detector>,
    probe_path: PathBuf,
}

impl DetectorProbe {
    pub fn new(detector: Arc<Detector>, probe_path: PathBuf) -> Self {
        Self { detector, probe_path }
    }
}

#[async_trait]
impl HealthProbe for DetectorProbe {
    fn name(&self) -> &'static str {
        "tech_stack_detector"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        // A missing probe directory is fine (`detect` returns None); the
        // probe only cares that the detector runs without panicking.
        let _ = self.detector.detect(&self.probe_path);
        ProbeResult::healthy(started.elapsed().as_millis() as u64)
    }
}

pub struct ControlPlaneProbe;

#[async_trait]
impl HealthProbe for ControlPlaneProbe {
    fn name(&self) -> &'static str {
        "control_plane"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        // Yielding once is enough to confirm the executor is scheduling
        // tasks promptly.
        tokio::task::yield_now().await;
        ProbeResult::healthy(started.elapsed().as_millis() as u64)
    }
}

pub struct FileSystemProbe {
    data_dir: PathBuf,
}

impl FileSystemProbe {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl HealthProbe for FileSystemProbe {
    fn name(&self) -> &'static str {
        "file_system"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        let probe_path = self.data_dir.join(".health_probe");
        let result = std::fs::write(&probe_path, b"ok").and_then(|_| std::fs::remove_file(&probe_path));
        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeResult::healthy(elapsed),
            Err(e) => ProbeResult::unhealthy(HealthState::Critical, elapsed, ErrorKind::Filesystem, &e.to_string()),
        }
    }
}

pub struct NetworkProbe {
    target: String,
}

impl NetworkProbe {
    /// `target` is a `host:port` loopback-reachable endpoint, typically the
    /// daemon's own API port.
    pub fn new(target: String) -> Self {
        Self { target }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn check(&self) -> ProbeResult {
        let started = Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            tokio::net::TcpStream::connect(&self.target),
        )
        .await;
        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(_)) => ProbeResult::healthy(elapsed),
            Ok(Err(e)) => ProbeResult::unhealthy(HealthState::Error, elapsed, ErrorKind::Network, &e.to_string()),
            Err(_) => ProbeResult::unhealthy(HealthState::Error, elapsed, ErrorKind::Network, "connect timed out"),
        }
    }
}
