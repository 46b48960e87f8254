//! MCP-style tool surface: `initialize`, `tools/list`, `tools/call`.
//! Grounded on spec section 6's three `/mcp/*` endpoints; tool
//! implementations delegate to the same service calls as the REST handlers
//! so there is exactly one code path per operation.

use std::path::PathBuf;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::error::ApiError;

pub async fn initialize(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": { "name": "debug-host", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": {} },
        "uptimeSecs": state.uptime_secs(),
    }))
}

struct ToolDef {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_catalog() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "list_projects",
            description: "List registered projects with derived status",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDef {
            name: "start_project",
            description: "Start a project's container",
            input_schema: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
            }),
        },
        ToolDef {
            name: "stop_project",
            description: "Stop a project's container",
            input_schema: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
            }),
        },
        ToolDef {
            name: "restart_project",
            description: "Restart a project's container",
            input_schema: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
            }),
        },
        ToolDef {
            name: "project_status",
            description: "Get a single project's derived status",
            input_schema: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
            }),
        },
        ToolDef {
            name: "exec_project",
            description: "Run a command inside a project's container",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "argv": { "type": "array", "items": { "type": "string" } },
                },
                "required": ["id", "argv"],
            }),
        },
        ToolDef {
            name: "suggest_ports",
            description: "Suggest free ports for a stack",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "count": { "type": "integer" },
                },
                "required": ["type"],
            }),
        },
    ]
}

pub async fn tools_list() -> Json<Value> {
    let tools: Vec<Value> = tool_catalog()
        .into_iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "inputSchema": t.input_schema }))
        .collect();
    Json(json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

fn arg_str(arguments: &Value, key: &str) -> Result<String, ApiError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::validation(format!("missing argument: {key}")))
}

pub async fn tools_call(State(state): State<AppState>, Json(body): Json<ToolCallRequest>) -> Response {
    let outcome = dispatch(&state, &body.name, &body.arguments).await;
    match outcome {
        Ok(result) => Json(json!({ "result": result, "error": null })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn dispatch(state: &AppState, name: &str, arguments: &Value) -> Result<Value, ApiError> {
    match name {
        "list_projects" => {
            let projects = state.projects.list();
            Ok(json!(projects))
        }
        "start_project" => {
            let id = arg_str(arguments, "id")?;
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
            let container_id = match &project.container_id {
                Some(cid) if state.lifecycle.get_record(cid).is_some() => cid.clone(),
                _ => {
                    let cid = state
                        .lifecycle
                        .create_container(
                            &project.id,
                            project.stack,
                            PathBuf::from(&project.workspace_path).as_path(),
                            project.port,
                            project.env.clone(),
                        )
                        .await?;
                    state.lifecycle.update_project_container(&project.id, Some(cid.clone())).await?;
                    cid
                }
            };
            state.lifecycle.start_container(&container_id).await?;
            state.collector.attach(&container_id);
            Ok(json!({ "projectId": id, "containerId": container_id }))
        }
        "stop_project" => {
            let id = arg_str(arguments, "id")?;
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
            if let Some(container_id) = &project.container_id {
                state.lifecycle.stop_container(container_id, 10).await?;
                state.collector.detach(container_id);
            }
            Ok(json!({ "projectId": id, "stopped": true }))
        }
        "restart_project" => {
            let id = arg_str(arguments, "id")?;
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
            let container_id = project
                .container_id
                .ok_or_else(|| ApiError::conflict("project has no running container"))?;
            state.lifecycle.restart_container(&container_id, 10).await?;
            Ok(json!({ "projectId": id, "restarted": true }))
        }
        "project_status" => {
            let id = arg_str(arguments, "id")?;
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
            let record = project.container_id.as_deref().and_then(|id| state.lifecycle.get_record(id));
            Ok(json!({ "project": project, "record": record }))
        }
        "exec_project" => {
            let id = arg_str(arguments, "id")?;
            let argv: Vec<String> = arguments
                .get("argv")
                .and_then(|v| v.as_array())
                .ok_or_else(|| ApiError::validation("missing argument: argv"))?
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| ApiError::not_found(format!("project not found: {id}")))?;
            let container_id = project
                .container_id
                .ok_or_else(|| ApiError::conflict("project has no running container"))?;
            let output = state.runtime.exec(&container_id, &argv).await?;
            Ok(json!({ "output": output }))
        }
        "suggest_ports" => {
            let stack_name = arg_str(arguments, "type")?;
            let count = arguments.get("count").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
            let stack = super::handlers::parse_stack(&stack_name)?;
            Ok(json!(state.ports.suggest(stack, count)))
        }
        other => Err(ApiError::validation(format!("unknown tool: {other}"))),
    }
}
