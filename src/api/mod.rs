//! C10 — API Surface.
//!
//! Stateless handlers over C2-C9, grounded on the teacher's axum router
//! assembly in `server::router` (one `AppState`, one `Router` built with
//! `.route`/`.with_state`, `tower-http` CORS + trace layers).

pub mod handlers;
pub mod mcp;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Configuration;
use crate::health::HealthEngine;
use crate::lifecycle::LifecycleManager;
use crate::logs::index::LogSearchIndex;
use crate::logs::LogPipeline;
use crate::metrics::collector::Collector;
use crate::metrics::store::MetricsStore;
use crate::metrics::stream::MetricStream;
use crate::ports::PortRegistry;
use crate::projects::ProjectRegistry;
use crate::runtime::ContainerRuntimeAdapter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub lifecycle: Arc<LifecycleManager>,
    pub ports: Arc<PortRegistry>,
    pub projects: Arc<ProjectRegistry>,
    pub runtime: Arc<dyn ContainerRuntimeAdapter>,
    pub logs: Arc<LogPipeline>,
    pub log_index: Arc<LogSearchIndex>,
    pub metrics_store: Arc<MetricsStore>,
    pub metrics_stream: Arc<MetricStream>,
    pub collector: Arc<Collector>,
    pub health: Arc<HealthEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Builds the combined MCP + REST router. Spec section 6 splits these
/// across two ports (`api.mcp_port`/`api.api_port`); both are served by the
/// same handler set here and `main` binds this router twice.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/mcp/initialize", post(mcp::initialize))
        .route("/mcp/tools/list", post(mcp::tools_list))
        .route("/mcp/tools/call", post(mcp::tools_call))
        .route("/mcp/logs/:project_id/stream", get(sse::log_stream))
        .route("/health", get(handlers::health))
        .route("/api/docs", get(handlers::docs))
        .route("/api/servers", get(handlers::list_projects))
        .route(
            "/api/projects",
            get(handlers::list_projects).post(handlers::register_project),
        )
        .route("/api/projects/:id", axum::routing::delete(handlers::delete_project))
        .route("/api/servers/:id/status", get(handlers::project_status))
        .route("/api/projects/:id/start", post(handlers::start_project))
        .route("/api/projects/:id/stop", post(handlers::stop_project))
        .route("/api/projects/:id/restart", post(handlers::restart_project))
        .route("/api/projects/:id/health", get(handlers::project_health))
        .route(
            "/api/projects/:id/config",
            get(handlers::get_project_config).put(handlers::put_project_config),
        )
        .route("/api/projects/batch", post(handlers::batch_projects))
        .route("/api/projects/:id/exec", post(handlers::exec_project))
        .route("/api/ports/suggest", get(handlers::suggest_ports))
        .route("/api/ports/:port/check", get(handlers::check_port))
        .route("/api/metrics/containers", get(handlers::list_container_metrics))
        .route("/api/metrics/stats", get(handlers::metrics_stats))
        .route("/api/metrics/:container_id", get(handlers::latest_metric))
        .route(
            "/api/metrics/:container_id/history",
            get(handlers::metrics_history),
        )
        .route("/api/metrics/:container_id/stream", get(sse::metrics_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
