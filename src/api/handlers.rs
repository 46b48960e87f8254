//! REST handlers for `/health`, `/api/docs`, `/api/servers|projects`,
//! `/api/ports`, `/api/metrics`. Grounded on the teacher's
//! `server::handlers` module: thin extractors that defer to a service
//! layer and map its errors with `?`.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::config::RunMode;
use crate::error::{ApiError, ApiResult};
use crate::events::ContainerState;
use crate::metrics::Resolution;
use crate::ports::Stack;
use crate::projects::{Project, ProjectUpdate};

#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    #[serde(flatten)]
    pub project: Project,
    pub state: ContainerState,
    pub healthy: bool,
}

fn derive_status(state: &AppState, project: &Project) -> ProjectStatus {
    let (container_state, healthy) = project
        .container_id
        .as_deref()
        .and_then(|id| state.lifecycle.get_record(id))
        .map(|r| (r.state, r.healthy))
        .unwrap_or((ContainerState::Stopped, false));
    ProjectStatus {
        project: project.clone(),
        state: container_state,
        healthy,
    }
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.health.run_once().await;
    Json(json!({
        "status": state.health.overall_state(),
        "uptime_secs": state.uptime_secs(),
        "subsystems": {
            "projects": state.projects.list().len(),
            "ports": state.ports.stats(),
            "metrics_subscribers": state.metrics_stream.subscriber_count(),
            "recovery": state.health.recovery_stats(),
        },
        "components": state.health.all_records(),
    }))
}

pub async fn docs() -> Json<serde_json::Value> {
    Json(json!({
        "name": "debug-host",
        "description": "local developer debug-host control plane",
        "endpoints": [
            "POST /mcp/initialize", "POST /mcp/tools/list", "POST /mcp/tools/call",
            "GET /health", "GET /api/docs",
            "GET /api/servers", "GET|POST /api/projects", "DELETE /api/projects/:id",
            "GET /api/servers/:id/status",
            "POST /api/projects/:id/start", "POST /api/projects/:id/stop",
            "POST /api/projects/:id/restart", "GET /api/projects/:id/health",
            "GET|PUT /api/projects/:id/config", "POST /api/projects/batch",
            "POST /api/projects/:id/exec",
            "GET /api/ports/suggest", "GET /api/ports/:port/check",
            "GET /api/metrics/containers", "GET /api/metrics/:containerId",
            "GET /api/metrics/:containerId/history", "GET /api/metrics/stats",
            "GET /mcp/logs/:projectId/stream", "GET /api/metrics/:containerId/stream",
        ],
    }))
}

pub async fn list_projects(State(state): State<AppState>) -> Json<Vec<ProjectStatus>> {
    let projects = state.projects.list();
    Json(projects.iter().map(|p| derive_status(&state, p)).collect())
}

#[derive(Debug, Deserialize)]
pub struct RegisterProjectRequest {
    pub name: String,
    pub workspace_path: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<String>,
}

/// `POST /api/projects`. Not named in spec section 6's endpoint table, but
/// section 4.4 names `create` as a core Project Registry operation and the
/// rest of the surface is unreachable without a way to register a project;
/// filled in per DESIGN.md.
pub async fn register_project(
    State(state): State<AppState>,
    Json(body): Json<RegisterProjectRequest>,
) -> ApiResult<Json<ProjectStatus>> {
    if state.projects.get_by_name(&body.name).is_some() {
        return Err(ApiError::conflict(format!("name already taken: {}", body.name)));
    }

    let workspace = PathBuf::from(&body.workspace_path);
    let detection = state.lifecycle.detector().detect(&workspace);
    let stack = match body.stack.as_deref() {
        Some(value) => parse_stack(value)?,
        None => detection.map(|d| d.stack).unwrap_or(Stack::Static),
    };

    let port = match body.port {
        Some(port) => {
            state.ports.allocate(port, stack, &body.name, None)?;
            port
        }
        None => {
            let outcome = state.ports.auto_allocate(stack, &body.name, None)?;
            outcome.port
        }
    };

    let project = match state
        .projects
        .create(&body.name, &body.workspace_path, stack, port, body.env, body.mounts)
    {
        Ok(project) => project,
        Err(e) => {
            let _ = state.ports.release(port, None);
            return Err(e.into());
        }
    };

    let _ = state.ports.release(port, None);
    state.ports.allocate(port, stack, &body.name, Some(project.id.clone()))?;

    Ok(Json(derive_status(&state, &project)))
}

pub async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    if let Some(container_id) = &project.container_id {
        let _ = state.lifecycle.remove_container(container_id, true).await;
        state.collector.detach(container_id);
    }
    state.projects.delete(&id, &state.ports)?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn project_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectStatus>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    Ok(Json(derive_status(&state, &project)))
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub native: bool,
}

/// `native=true`, or the daemon itself configured into `RunMode::Native`
/// (`DEBUG_HOST_MODE=native`), requests the native-process path. There is
/// no native process executor in this daemon (logs/metrics/health all
/// assume a container, see `DESIGN.md`), so this resolves only the part of
/// spec section 9's native-mode Open Question that's actually actionable
/// here: the port race. A native start reclaims the project's port through
/// the identical `PortRegistry::allocate` call the container path uses and
/// fails the whole request if the port can't be (re)claimed atomically,
/// rather than racing the OS for it — then reports the rest of native
/// execution as unimplemented instead of silently falling through to the
/// container path.
pub async fn start_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StartQuery>,
) -> ApiResult<Json<ProjectStatus>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    let native = query.native || state.lifecycle.mode() == RunMode::Native;

    if native {
        // Same release-then-allocate reclaim `register_project` uses: not a
        // single atomic registry call (none exists), but it fails the whole
        // start rather than silently letting whoever grabs the port in
        // between win.
        let _ = state.ports.release(project.port, Some(&project.id));
        state
            .ports
            .allocate(project.port, project.stack, &project.name, Some(project.id.clone()))
            .map_err(|_| {
                ApiError::conflict(format!(
                    "port {} could not be reclaimed for native start",
                    project.port
                ))
            })?;
        return Err(ApiError::validation(
            "native process execution is not implemented; omit native=true to use the container path",
        ));
    }

    let container_id = match &project.container_id {
        Some(id) if state.lifecycle.get_record(id).is_some() => id.clone(),
        _ => {
            let id = state
                .lifecycle
                .create_container(
                    &project.id,
                    project.stack,
                    PathBuf::from(&project.workspace_path).as_path(),
                    project.port,
                    project.env.clone(),
                )
                .await?;
            state.lifecycle.update_project_container(&project.id, Some(id.clone())).await?;
            id
        }
    };

    state.lifecycle.start_container(&container_id).await?;
    state.collector.attach(&container_id);
    crate::logs::tail::spawn_tail(
        state.runtime.clone(),
        state.logs.clone(),
        container_id.clone(),
        container_id.clone(),
        tokio_util::sync::CancellationToken::new(),
    );

    let updated = state.projects.get(&id).unwrap_or(project);
    Ok(Json(derive_status(&state, &updated)))
}

pub async fn stop_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectStatus>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    if let Some(container_id) = &project.container_id {
        state.lifecycle.stop_container(container_id, 10).await?;
        state.collector.detach(container_id);
    }
    Ok(Json(derive_status(&state, &project)))
}

pub async fn restart_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectStatus>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    let container_id = project
        .container_id
        .clone()
        .ok_or_else(|| ApiError::conflict("project has no running container"))?;
    state.lifecycle.restart_container(&container_id, 10).await?;
    Ok(Json(derive_status(&state, &project)))
}

pub async fn project_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    let record = project.container_id.as_deref().and_then(|id| state.lifecycle.get_record(id));
    Ok(Json(json!({ "projectId": id, "record": record })))
}

#[derive(Debug, Serialize)]
pub struct ProjectConfig {
    pub env: HashMap<String, String>,
    pub mounts: Vec<String>,
    pub port: u16,
}

pub async fn get_project_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectConfig>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    Ok(Json(ProjectConfig {
        env: project.env,
        mounts: project.mounts,
        port: project.port,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ProjectConfigUpdate {
    pub env: Option<HashMap<String, String>>,
    pub mounts: Option<Vec<String>>,
}

pub async fn put_project_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProjectConfigUpdate>,
) -> ApiResult<Json<Project>> {
    let updated = state.projects.update(
        &id,
        ProjectUpdate {
            env: body.env,
            mounts: body.mounts,
            ..Default::default()
        },
    )?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub op: String,
    pub ids: Vec<String>,
}

pub async fn batch_projects(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let container_ids: Vec<String> = body
        .ids
        .iter()
        .filter_map(|id| state.projects.get(id))
        .filter_map(|p| p.container_id)
        .collect();

    let op = body.op.clone();
    let lifecycle = state.lifecycle.clone();
    let for_closure = lifecycle.clone();
    let results = match op.as_str() {
        "start" => {
            lifecycle
                .batch(container_ids, move |id| {
                    let lifecycle = for_closure.clone();
                    async move { lifecycle.start_container(&id).await }
                })
                .await
        }
        "stop" => {
            lifecycle
                .batch(container_ids, move |id| {
                    let lifecycle = for_closure.clone();
                    async move { lifecycle.stop_container(&id, 10).await }
                })
                .await
        }
        "restart" => {
            lifecycle
                .batch(container_ids, move |id| {
                    let lifecycle = for_closure.clone();
                    async move { lifecycle.restart_container(&id, 10).await }
                })
                .await
        }
        other => return Err(ApiError::validation(format!("unknown batch op: {other}"))),
    };

    Ok(Json(json!({ "op": op, "results": results })))
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub argv: Vec<String>,
}

pub async fn exec_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state.projects.get(&id).ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
    let container_id = project
        .container_id
        .ok_or_else(|| ApiError::conflict("project has no running container"))?;
    let output = state.runtime.exec(&container_id, &body.argv).await?;
    Ok(Json(json!({ "output": output })))
}

#[derive(Debug, Deserialize)]
pub struct SuggestQuery {
    #[serde(rename = "type")]
    pub stack: String,
    #[serde(default = "default_suggest_count")]
    pub count: usize,
}

fn default_suggest_count() -> usize {
    3
}

pub(crate) fn parse_stack(value: &str) -> ApiResult<Stack> {
    match value.to_lowercase().as_str() {
        "node" => Ok(Stack::Node),
        "vite" => Ok(Stack::Vite),
        "python" => Ok(Stack::Python),
        "php" => Ok(Stack::Php),
        "static" => Ok(Stack::Static),
        "go" => Ok(Stack::Go),
        "rust" => Ok(Stack::Rust),
        "java" => Ok(Stack::Java),
        "ruby" => Ok(Stack::Ruby),
        "dotnet" => Ok(Stack::Dotnet),
        other => Err(ApiError::validation(format!("unknown stack: {other}"))),
    }
}

pub async fn suggest_ports(
    State(state): State<AppState>,
    Query(query): Query<SuggestQuery>,
) -> ApiResult<Json<Vec<u16>>> {
    let stack = parse_stack(&query.stack)?;
    Ok(Json(state.ports.suggest(stack, query.count)))
}

pub async fn check_port(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Json<serde_json::Value> {
    Json(json!({ "port": port, "allocated": state.ports.is_allocated(port) }))
}

pub async fn list_container_metrics(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(
        state
            .projects
            .list()
            .into_iter()
            .filter_map(|p| p.container_id)
            .filter(|id| state.metrics_store.has_data(id))
            .collect(),
    )
}

pub async fn latest_metric(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = state.metrics_store.query(&container_id, None, None, Resolution::Raw, 1);
    match result {
        crate::metrics::store::QueryResult::Raw(samples) => samples
            .last()
            .cloned()
            .map(|s| Json(json!(s)))
            .ok_or_else(|| ApiError::not_found(format!("no metrics for {container_id}"))),
        _ => unreachable!(),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    500
}

fn parse_resolution(value: Option<&str>) -> Resolution {
    match value.unwrap_or("raw") {
        "minute" => Resolution::Minute,
        "fiveMinute" => Resolution::FiveMinute,
        "fifteenMinute" => Resolution::FifteenMinute,
        "hour" => Resolution::Hour,
        "day" => Resolution::Day,
        _ => Resolution::Raw,
    }
}

pub async fn metrics_history(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let resolution = parse_resolution(query.resolution.as_deref());
    let result = state
        .metrics_store
        .query(&container_id, query.start_time, query.end_time, resolution, query.limit);
    match result {
        crate::metrics::store::QueryResult::Raw(samples) => Json(json!({ "samples": samples })),
        crate::metrics::store::QueryResult::Aggregated(points) => Json(json!({ "buckets": points })),
    }
}

pub async fn metrics_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "activeSamplers": state.collector.active_count(),
        "subscribers": state.metrics_stream.subscriber_count(),
    }))
}
