//! CLI entrypoint. Grounded on the teacher's `main.rs`: `clap` derive
//! subcommands, `tracing_subscriber` env-filter init, and an explicit
//! startup/shutdown sequence rather than relying on `Drop` for persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use debug_host::api::{build_router, AppState};
use debug_host::config::Configuration;
use debug_host::detect::Detector;
use debug_host::events::EventBus;
use debug_host::health::probes::{
    ControlPlaneProbe, DaemonProbe, DetectorProbe, FileSystemProbe, NetworkProbe,
    PortRegistryProbe, ProjectRegistryProbe,
};
use debug_host::health::recovery::Recoverer;
use debug_host::health::{HealthEngine, HealthProbe};
use debug_host::lifecycle::LifecycleManager;
use debug_host::logs::index::LogSearchIndex;
use debug_host::logs::LogPipeline;
use debug_host::metrics::collector::Collector;
use debug_host::metrics::store::MetricsStore;
use debug_host::metrics::stream::MetricStream;
use debug_host::ports::PortRegistry;
use debug_host::projects::ProjectRegistry;
use debug_host::runtime::docker::DockerRuntime;
use debug_host::runtime::ContainerRuntimeAdapter;
use debug_host::scheduler;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "debug-host", about = "Local developer debug-host control plane")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true, default_value = "debug-host.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default when no subcommand is given).
    Run,
    /// Probe every subsystem once and print the result without serving.
    Diagnostics,
    /// Print the resolved configuration (after env overrides) as TOML.
    Configure,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let exit_code = match cli.command.unwrap_or(Command::Run) {
        Command::Run => runtime.block_on(run(cli.config)),
        Command::Diagnostics => runtime.block_on(diagnostics(cli.config)),
        Command::Configure => configure(cli.config),
    };
    std::process::exit(exit_code);
}

fn configure(config_path: PathBuf) -> i32 {
    match Configuration::load(&config_path) {
        Ok(config) => match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                0
            }
            Err(e) => {
                error!(error = %e, "failed to render configuration");
                1
            }
        },
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            1
        }
    }
}

struct Subsystems {
    config: Arc<Configuration>,
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    ports: Arc<PortRegistry>,
    projects: Arc<ProjectRegistry>,
    lifecycle: Arc<LifecycleManager>,
    logs: Arc<LogPipeline>,
    log_index: Arc<LogSearchIndex>,
    metrics_store: Arc<MetricsStore>,
    metrics_stream: Arc<MetricStream>,
    collector: Arc<Collector>,
    health: Arc<HealthEngine>,
    events: EventBus,
}

/// Builds every subsystem and wires their dependencies, but starts no
/// background tasks. Shared by `run` and `diagnostics` so a one-shot probe
/// doesn't need to duplicate construction.
async fn build_subsystems(config_path: &std::path::Path) -> anyhow::Result<Subsystems> {
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    let runtime: Arc<dyn ContainerRuntimeAdapter> =
        Arc::new(DockerRuntime::connect(&config.docker.socket)?);
    runtime.ping().await?;

    let ports = Arc::new(PortRegistry::load(&config.data_directory)?);
    let projects = Arc::new(ProjectRegistry::load(&config.data_directory)?);
    let events = EventBus::new();

    let lifecycle = Arc::new(LifecycleManager::new(
        runtime.clone(),
        ports.clone(),
        projects.clone(),
        events.clone(),
        &config,
    ));
    lifecycle.ensure_network().await?;

    let logs = Arc::new(LogPipeline::new(&config, events.clone()));
    let log_index = Arc::new(LogSearchIndex::new(config.logs_dir()));

    let metrics_store = Arc::new(MetricsStore::load(config.metrics_dir())?);
    let metrics_stream = Arc::new(MetricStream::new(metrics_store.clone()));
    let collector = Arc::new(Collector::new(
        runtime.clone(),
        metrics_store.clone(),
        events.clone(),
        config.metrics.clone(),
    ));

    let recoverer = Arc::new(Recoverer::new());
    let probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(DaemonProbe::new(runtime.clone())),
        Arc::new(PortRegistryProbe::new(ports.clone())),
        Arc::new(ProjectRegistryProbe::new(projects.clone())),
        Arc::new(DetectorProbe::new(
            Arc::new(Detector::new()),
            config.data_directory.clone(),
        )),
        Arc::new(ControlPlaneProbe),
        Arc::new(FileSystemProbe::new(config.data_directory.clone())),
        Arc::new(NetworkProbe::new(format!(
            "{}:{}",
            config.api.host, config.api.mcp_port
        ))),
    ];
    let health = Arc::new(HealthEngine::new(probes, recoverer));

    Ok(Subsystems {
        config,
        runtime,
        ports,
        projects,
        lifecycle,
        logs,
        log_index,
        metrics_store,
        metrics_stream,
        collector,
        health,
        events,
    })
}

async fn diagnostics(config_path: PathBuf) -> i32 {
    let subsystems = match build_subsystems(&config_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "diagnostics startup failed");
            return 1;
        }
    };
    subsystems.health.run_once().await;
    for record in subsystems.health.all_records() {
        info!(
            component = %record.component,
            state = ?record.state,
            avg_response_ms = record.avg_response_time_ms,
            "probe result"
        );
    }
    let summary = serde_json::json!({
        "overall": subsystems.health.overall_state(),
        "components": subsystems.health.all_records(),
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => error!(error = %e, "failed to render diagnostics summary"),
    }
    0
}

/// Spawns every periodic task named in spec section 4.7/4.8/4.9 and returns
/// their handles so `run` can cancel them on shutdown. A forgotten handle
/// (the scheduler's own default) just keeps the loop alive, which is fine
/// for the process-lifetime background jobs started here.
fn spawn_background_jobs(subsystems: &Subsystems) -> scheduler::JobRegistry {
    let mut registry = scheduler::JobRegistry::new();

    let logs = subsystems.logs.clone();
    let (handle, _) = scheduler::schedule("log-subscription-sweep", Duration::from_secs(60), false, move || {
        let logs = logs.clone();
        async move {
            let dropped = logs.sweep_inactive();
            if dropped > 0 {
                warn!(dropped, "pruned inactive log subscriptions");
            }
        }
    });
    registry.push(handle);

    let log_index = subsystems.log_index.clone();
    let projects_for_index = subsystems.projects.clone();
    let refresh_secs = subsystems.config.logs.index_refresh_secs.max(1);
    let (handle, _) = scheduler::schedule(
        "log-index-refresh",
        Duration::from_secs(refresh_secs),
        true,
        move || {
            let log_index = log_index.clone();
            let projects = projects_for_index.clone();
            async move {
                for project in projects.list() {
                    let Some(container_id) = project.container_id else {
                        continue;
                    };
                    if let Err(e) = log_index.refresh(&container_id) {
                        warn!(error = %e, container_id, "log index refresh failed");
                    }
                }
            }
        },
    );
    registry.push(handle);

    let metrics_store = subsystems.metrics_store.clone();
    let aggregate_secs = subsystems.config.metrics.aggregation_interval_secs.max(1);
    let (handle, _) = scheduler::schedule(
        "metrics-aggregation",
        Duration::from_secs(aggregate_secs),
        false,
        move || {
            let metrics_store = metrics_store.clone();
            async move {
                metrics_store.aggregate();
                if let Err(e) = metrics_store.persist() {
                    warn!(error = %e, "metrics snapshot persist failed");
                }
            }
        },
    );
    registry.push(handle);

    let metrics_store = subsystems.metrics_store.clone();
    let retention_secs = subsystems.config.metrics.retention_sweep_secs.max(1);
    let (handle, _) = scheduler::schedule(
        "metrics-retention-sweep",
        Duration::from_secs(retention_secs),
        false,
        move || {
            let metrics_store = metrics_store.clone();
            async move {
                metrics_store.retention_sweep();
            }
        },
    );
    registry.push(handle);

    let metrics_stream = subsystems.metrics_stream.clone();
    let (handle, _) = scheduler::schedule(
        "metrics-subscription-sweep",
        Duration::from_secs(60),
        false,
        move || {
            let metrics_stream = metrics_stream.clone();
            async move {
                metrics_stream.sweep_inactive();
            }
        },
    );
    registry.push(handle);

    let health = subsystems.health.clone();
    let health_secs = subsystems.config.health.check_interval_secs.max(1);
    let (handle, _) = scheduler::schedule(
        "health-check",
        Duration::from_secs(health_secs),
        false,
        move || {
            let health = health.clone();
            async move {
                health.run_once().await;
            }
        },
    );
    registry.push(handle);

    let lifecycle = subsystems.lifecycle.clone();
    let (handle, _) = scheduler::schedule("orphan-cleanup", Duration::from_secs(300), false, move || {
        let lifecycle = lifecycle.clone();
        async move {
            if let Err(e) = lifecycle.cleanup_orphans().await {
                warn!(error = %e, "orphan cleanup failed");
            }
        }
    });
    registry.push(handle);

    let lifecycle = subsystems.lifecycle.clone();
    let (handle, _) = scheduler::schedule("exit-reconciliation", Duration::from_secs(10), false, move || {
        let lifecycle = lifecycle.clone();
        async move {
            let flipped = lifecycle.reconcile_exits().await;
            if flipped > 0 {
                info!(flipped, "flipped exited containers to Exited");
            }
        }
    });
    registry.push(handle);

    // Bridges the internal event bus into the metrics stream's per-subscriber
    // fan-out; the metrics store itself is updated directly by the collector.
    let mut event_rx = subsystems.events.subscribe();
    let metrics_stream = subsystems.metrics_stream.clone();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(debug_host::events::Event::Metric { sample, .. }) => metrics_stream.route(&sample),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event bus consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    registry
}

async fn run(config_path: PathBuf) -> i32 {
    let subsystems = match build_subsystems(&config_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "startup failed");
            return 1;
        }
    };

    let jobs = spawn_background_jobs(&subsystems);

    let state = AppState {
        config: subsystems.config.clone(),
        lifecycle: subsystems.lifecycle.clone(),
        ports: subsystems.ports.clone(),
        projects: subsystems.projects.clone(),
        runtime: subsystems.runtime.clone(),
        logs: subsystems.logs.clone(),
        log_index: subsystems.log_index.clone(),
        metrics_store: subsystems.metrics_store.clone(),
        metrics_stream: subsystems.metrics_stream.clone(),
        collector: subsystems.collector.clone(),
        health: subsystems.health.clone(),
        started_at: chrono::Utc::now(),
    };

    let router = build_router(state);

    let mcp_addr = format!("{}:{}", subsystems.config.api.host, subsystems.config.api.mcp_port);
    let api_addr = format!("{}:{}", subsystems.config.api.host, subsystems.config.api.api_port);

    let mcp_listener = match tokio::net::TcpListener::bind(&mcp_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %mcp_addr, error = %e, "failed to bind MCP port");
            return 1;
        }
    };
    let api_listener = match tokio::net::TcpListener::bind(&api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %api_addr, error = %e, "failed to bind API port");
            return 1;
        }
    };

    info!(mcp = %mcp_addr, api = %api_addr, "debug-host listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mcp_router = router.clone();
    let api_router = router.clone();
    tokio::select! {
        result = axum::serve(mcp_listener, mcp_router) => {
            if let Err(e) = result {
                error!(error = %e, "mcp server exited with error");
            }
        }
        result = axum::serve(api_listener, api_router) => {
            if let Err(e) = result {
                error!(error = %e, "api server exited with error");
            }
        }
        _ = &mut shutdown => {
            info!("shutdown signal received");
        }
    }

    jobs.cancel_all();

    if let Err(e) = subsystems.metrics_store.persist() {
        error!(error = %e, "final metrics snapshot failed");
        return 1;
    }

    info!("clean shutdown complete");
    0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
