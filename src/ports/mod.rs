//! C2 — Port Registry.
//!
//! Range-partitioned port allocator with JSON persistence (via C1), OS-level
//! conflict probing, and project-scoped release. Grounded on the teacher's
//! `database::state::StateStore` for its get/save/delete/list shape, but
//! backed by the atomic JSON file store (`crate::store`) rather than SQLite,
//! per spec section 6's persistence layout (`system/ports.json`).

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store;

/// System range never handed out, per spec section 3.
pub const SYSTEM_RANGE: (u16, u16) = (2601, 2699);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    Node,
    Vite,
    Python,
    Php,
    Static,
    Go,
    Rust,
    Java,
    Ruby,
    Dotnet,
}

impl Stack {
    /// The contiguous range reserved for this stack, per spec section 3/4.2.
    /// Node and Vite share a band (Vite is a Node dev-server variant); the
    /// remaining detector-recognized stacks (go/rust/java/ruby/dotnet) have
    /// no band named in the spec, so they share one generic high range
    /// outside any reserved band, recorded as a design decision in
    /// `DESIGN.md`.
    pub fn band(self) -> (u16, u16) {
        match self {
            Stack::Node | Stack::Vite => (3000, 3999),
            Stack::Static => (4000, 4999),
            Stack::Python => (5000, 5999),
            Stack::Php => (8080, 8980),
            Stack::Go | Stack::Rust | Stack::Java | Stack::Ruby | Stack::Dotnet => {
                (49152, 65000)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stack::Node => "node",
            Stack::Vite => "vite",
            Stack::Python => "python",
            Stack::Php => "php",
            Stack::Static => "static",
            Stack::Go => "go",
            Stack::Rust => "rust",
            Stack::Java => "java",
            Stack::Ruby => "ruby",
            Stack::Dotnet => "dotnet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortErrorCode {
    #[error("INVALID_PORT")]
    InvalidPort,
    #[error("SYSTEM_RESERVED")]
    SystemReserved,
    #[error("PORT_OUT_OF_RANGE")]
    PortOutOfRange,
    #[error("PORT_IN_USE")]
    PortInUse,
    #[error("PORT_IN_USE_EXTERNAL")]
    PortInUseExternal,
    #[error("NO_AVAILABLE_PORTS")]
    NoAvailablePorts,
    #[error("PROJECT_MISMATCH")]
    ProjectMismatch,
    #[error("INVALID_PROJECT_TYPE")]
    InvalidProjectType,
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Code(#[from] PortErrorCode),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
}

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub port: u16,
    pub project_id: Option<String>,
    pub name: String,
    pub stack: Stack,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Allocate,
    Release,
    Cleanup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: HistoryKind,
    pub port: u16,
    pub project_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PortFile {
    allocations: HashMap<u16, Allocation>,
    history: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocateOutcome {
    pub port: u16,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandStats {
    pub stack: Stack,
    pub band_start: u16,
    pub band_end: u16,
    pub allocated: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub bands: Vec<BandStats>,
    pub history_len: usize,
}

const HISTORY_CAP: usize = 100;

pub struct PortRegistry {
    path: PathBuf,
    state: RwLock<PortFile>,
}

impl PortRegistry {
    pub fn load(data_dir: &std::path::Path) -> PortResult<Self> {
        let path = data_dir.join("system").join("ports.json");
        let state: PortFile = store::read_json(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &PortFile) -> PortResult<()> {
        store::write_json(&self.path, state)?;
        Ok(())
    }

    fn validate_port(port: u16, stack: Stack) -> Result<(), PortErrorCode> {
        if port == 0 {
            return Err(PortErrorCode::InvalidPort);
        }
        if port >= SYSTEM_RANGE.0 && port <= SYSTEM_RANGE.1 {
            return Err(PortErrorCode::SystemReserved);
        }
        let (start, end) = stack.band();
        if port < start || port > end {
            return Err(PortErrorCode::PortOutOfRange);
        }
        Ok(())
    }

    /// TCP bind-on-loopback probe: a successful bind+close means free.
    fn os_probe_free(port: u16) -> bool {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        TcpListener::bind(addr).is_ok()
    }

    pub fn allocate(
        &self,
        port: u16,
        stack: Stack,
        name: &str,
        project_id: Option<String>,
    ) -> PortResult<AllocateOutcome> {
        Self::validate_port(port, stack)?;

        let mut state = self.state.write();
        if state.allocations.contains_key(&port) {
            return Err(PortErrorCode::PortInUse.into());
        }
        if !Self::os_probe_free(port) {
            return Err(PortErrorCode::PortInUseExternal.into());
        }

        let allocation = Allocation {
            port,
            project_id: project_id.clone(),
            name: name.to_string(),
            stack,
            allocated_at: Utc::now(),
        };
        state.allocations.insert(port, allocation);
        push_history(
            &mut state.history,
            HistoryEvent {
                kind: HistoryKind::Allocate,
                port,
                project_id: project_id.clone(),
                at: Utc::now(),
            },
        );
        self.persist(&state)?;

        Ok(AllocateOutcome { port, project_id })
    }

    pub fn auto_allocate(
        &self,
        stack: Stack,
        name: &str,
        project_id: Option<String>,
    ) -> PortResult<AllocateOutcome> {
        let (start, end) = stack.band();
        let mut state = self.state.write();
        for port in start..=end {
            if state.allocations.contains_key(&port) {
                continue;
            }
            if !Self::os_probe_free(port) {
                continue;
            }
            let allocation = Allocation {
                port,
                project_id: project_id.clone(),
                name: name.to_string(),
                stack,
                allocated_at: Utc::now(),
            };
            state.allocations.insert(port, allocation);
            push_history(
                &mut state.history,
                HistoryEvent {
                    kind: HistoryKind::Allocate,
                    port,
                    project_id: project_id.clone(),
                    at: Utc::now(),
                },
            );
            self.persist(&state)?;
            return Ok(AllocateOutcome { port, project_id });
        }
        Err(PortErrorCode::NoAvailablePorts.into())
    }

    pub fn release(&self, port: u16, project_id: Option<&str>) -> PortResult<()> {
        let mut state = self.state.write();
        if let Some(allocation) = state.allocations.get(&port) {
            if let Some(pid) = project_id {
                if allocation.project_id.as_deref() != Some(pid) {
                    return Err(PortErrorCode::ProjectMismatch.into());
                }
            }
        } else {
            return Ok(());
        }
        state.allocations.remove(&port);
        push_history(
            &mut state.history,
            HistoryEvent {
                kind: HistoryKind::Release,
                port,
                project_id: project_id.map(|s| s.to_string()),
                at: Utc::now(),
            },
        );
        self.persist(&state)?;
        Ok(())
    }

    pub fn suggest(&self, stack: Stack, count: usize) -> Vec<u16> {
        let (start, end) = stack.band();
        let state = self.state.read();
        let mut out = Vec::with_capacity(count);
        for port in start..=end {
            if out.len() >= count {
                break;
            }
            if state.allocations.contains_key(&port) {
                continue;
            }
            if Self::os_probe_free(port) {
                out.push(port);
            }
        }
        out
    }

    pub fn release_project(&self, project_id: &str) -> PortResult<Vec<u16>> {
        let mut state = self.state.write();
        let ports: Vec<u16> = state
            .allocations
            .values()
            .filter(|a| a.project_id.as_deref() == Some(project_id))
            .map(|a| a.port)
            .collect();
        for port in &ports {
            state.allocations.remove(port);
            push_history(
                &mut state.history,
                HistoryEvent {
                    kind: HistoryKind::Release,
                    port: *port,
                    project_id: Some(project_id.to_string()),
                    at: Utc::now(),
                },
            );
        }
        if !ports.is_empty() {
            self.persist(&state)?;
        }
        Ok(ports)
    }

    pub fn cleanup_orphans(&self) -> PortResult<Vec<u16>> {
        let mut state = self.state.write();
        let orphans: Vec<u16> = state
            .allocations
            .keys()
            .copied()
            .filter(|p| Self::os_probe_free(*p))
            .collect();
        for port in &orphans {
            state.allocations.remove(port);
            push_history(
                &mut state.history,
                HistoryEvent {
                    kind: HistoryKind::Cleanup,
                    port: *port,
                    project_id: None,
                    at: Utc::now(),
                },
            );
        }
        if !orphans.is_empty() {
            self.persist(&state)?;
        }
        Ok(orphans)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let stacks = [
            Stack::Node,
            Stack::Static,
            Stack::Python,
            Stack::Php,
            Stack::Go,
            Stack::Rust,
            Stack::Java,
            Stack::Ruby,
            Stack::Dotnet,
        ];
        let bands = stacks
            .into_iter()
            .map(|stack| {
                let (start, end) = stack.band();
                let allocated = state
                    .allocations
                    .values()
                    .filter(|a| a.stack.band() == (start, end))
                    .count();
                BandStats {
                    stack,
                    band_start: start,
                    band_end: end,
                    allocated,
                    total: (end - start + 1) as usize,
                }
            })
            .collect();
        RegistryStats {
            bands,
            history_len: state.history.len(),
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.state.read().allocations.contains_key(&port)
    }
}

fn push_history(history: &mut Vec<HistoryEvent>, event: HistoryEvent) {
    history.push(event);
    if history.len() > HISTORY_CAP {
        let overflow = history.len() - HISTORY_CAP;
        history.drain(0..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, PortRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = PortRegistry::load(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn allocate_conflict_release_cycle() {
        let (_dir, reg) = registry();
        let out = reg
            .allocate(3000, Stack::Node, "web", Some("p1".into()))
            .unwrap();
        assert_eq!(out.port, 3000);

        let err = reg
            .allocate(3000, Stack::Node, "api", Some("p2".into()))
            .unwrap_err();
        assert!(matches!(err, PortError::Code(PortErrorCode::PortInUse)));

        reg.release(3000, Some("p1")).unwrap();
        assert!(!reg.is_allocated(3000));

        let out2 = reg
            .allocate(3000, Stack::Node, "api", Some("p2".into()))
            .unwrap();
        assert_eq!(out2.port, 3000);
    }

    #[test]
    fn system_range_rejected() {
        let (_dir, reg) = registry();
        let err = reg.allocate(2650, Stack::Node, "x", None).unwrap_err();
        assert!(matches!(err, PortError::Code(PortErrorCode::SystemReserved)));
    }

    #[test]
    fn out_of_band_rejected() {
        let (_dir, reg) = registry();
        let err = reg.allocate(5000, Stack::Node, "x", None).unwrap_err();
        assert!(matches!(err, PortError::Code(PortErrorCode::PortOutOfRange)));
    }

    #[test]
    fn release_with_mismatched_project_fails() {
        let (_dir, reg) = registry();
        reg.allocate(3001, Stack::Node, "web", Some("p1".into()))
            .unwrap();
        let err = reg.release(3001, Some("other")).unwrap_err();
        assert!(matches!(err, PortError::Code(PortErrorCode::ProjectMismatch)));
    }

    #[test]
    fn release_project_frees_all_its_ports() {
        let (_dir, reg) = registry();
        reg.allocate(3002, Stack::Node, "a", Some("p1".into()))
            .unwrap();
        reg.allocate(3003, Stack::Node, "b", Some("p1".into()))
            .unwrap();
        let released = reg.release_project("p1").unwrap();
        assert_eq!(released.len(), 2);
        assert!(!reg.is_allocated(3002));
        assert!(!reg.is_allocated(3003));
    }
}
