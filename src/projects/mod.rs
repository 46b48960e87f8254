//! C4 — Project Registry.
//!
//! Persists the set of registered projects. Grounded on the teacher's
//! `server::manager::Manager` for its `DashMap`-backed collection shape, but
//! persisted through the atomic JSON file store (C1) rather than fetched
//! from a remote panel — this registry is itself the source of truth.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::{PortError, PortRegistry, Stack};
use crate::store;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("a project named '{0}' already exists")]
    NameTaken(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
}

pub type ProjectResult<T> = Result<T, ProjectError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub workspace_path: String,
    pub stack: Stack,
    pub port: u16,
    pub container_id: Option<String>,
    pub env: std::collections::HashMap<String, String>,
    pub mounts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub container_id: Option<Option<String>>,
    pub env: Option<std::collections::HashMap<String, String>>,
    pub mounts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ProjectsFile {
    projects: Vec<Project>,
}

/// Generates `proj_<base36-time><base36-rand>`, per spec section 3.
pub fn new_project_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let rand_part: u32 = rand::thread_rng().gen();
    format!("proj_{}{}", to_base36(millis), to_base36(rand_part as u64))
}

fn to_base36(mut value: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

pub struct ProjectRegistry {
    path: PathBuf,
    projects: DashMap<String, Project>,
}

impl ProjectRegistry {
    pub fn load(data_dir: &std::path::Path) -> ProjectResult<Self> {
        let path = data_dir.join("system").join("projects.json");
        let file: ProjectsFile = store::read_json(&path)?;
        let projects = DashMap::new();
        for project in file.projects {
            projects.insert(project.id.clone(), project);
        }
        Ok(Self { path, projects })
    }

    fn persist(&self) -> ProjectResult<()> {
        let projects: Vec<Project> = self.projects.iter().map(|e| e.value().clone()).collect();
        store::write_json(&self.path, &ProjectsFile { projects })?;
        Ok(())
    }

    pub fn create(
        &self,
        name: &str,
        workspace_path: &str,
        stack: Stack,
        port: u16,
        env: std::collections::HashMap<String, String>,
        mounts: Vec<String>,
    ) -> ProjectResult<Project> {
        if self.projects.iter().any(|e| e.value().name == name) {
            return Err(ProjectError::NameTaken(name.to_string()));
        }
        let now = Utc::now();
        let project = Project {
            id: new_project_id(),
            name: name.to_string(),
            workspace_path: workspace_path.to_string(),
            stack,
            port,
            container_id: None,
            env,
            mounts,
            created_at: now,
            updated_at: now,
        };
        self.projects.insert(project.id.clone(), project.clone());
        self.persist()?;
        Ok(project)
    }

    pub fn get(&self, id: &str) -> Option<Project> {
        self.projects.get(id).map(|e| e.value().clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Project> {
        self.projects
            .iter()
            .find(|e| e.value().name == name)
            .map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Project> {
        self.projects.iter().map(|e| e.value().clone()).collect()
    }

    pub fn update(&self, id: &str, update: ProjectUpdate) -> ProjectResult<Project> {
        let mut entry = self
            .projects
            .get_mut(id)
            .ok_or_else(|| ProjectError::NotFound(id.to_string()))?;
        if let Some(container_id) = update.container_id {
            entry.container_id = container_id;
        }
        if let Some(env) = update.env {
            entry.env = env;
        }
        if let Some(mounts) = update.mounts {
            entry.mounts = mounts;
        }
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        drop(entry);
        self.persist()?;
        Ok(updated)
    }

    /// Deletes a project and releases every port it holds through the port
    /// registry, preserving referential consistency without a back-pointer
    /// (spec section 9: cyclic relationships resolved by one-way
    /// ownership through method calls).
    pub fn delete(&self, id: &str, ports: &PortRegistry) -> ProjectResult<()> {
        let project = self
            .projects
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ProjectError::NotFound(id.to_string()))?;
        ports.release_project(&project.id)?;
        self.projects.remove(id);
        self.persist()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ProjectRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::load(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn create_get_list() {
        let (_dir, reg) = registry();
        let project = reg
            .create(
                "web",
                "/workspace/web",
                Stack::Node,
                3000,
                Default::default(),
                vec![],
            )
            .unwrap();
        assert_eq!(reg.get(&project.id).unwrap().name, "web");
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_dir, reg) = registry();
        reg.create("web", "/a", Stack::Node, 3000, Default::default(), vec![])
            .unwrap();
        let err = reg
            .create("web", "/b", Stack::Node, 3001, Default::default(), vec![])
            .unwrap_err();
        assert!(matches!(err, ProjectError::NameTaken(_)));
    }

    #[test]
    fn delete_releases_ports() {
        let (dir, reg) = registry();
        let ports = PortRegistry::load(dir.path()).unwrap();
        let port = ports
            .allocate(3010, Stack::Node, "web", Some("will-be-set".into()))
            .unwrap()
            .port;
        let project = reg
            .create("web", "/a", Stack::Node, port, Default::default(), vec![])
            .unwrap();
        ports.release(port, None).unwrap();
        ports
            .allocate(port, Stack::Node, "web", Some(project.id.clone()))
            .unwrap();

        reg.delete(&project.id, &ports).unwrap();
        assert!(reg.get(&project.id).is_none());
        assert!(!ports.is_allocated(port));
    }

    #[test]
    fn project_ids_look_right() {
        let id = new_project_id();
        assert!(id.starts_with("proj_"));
    }
}
