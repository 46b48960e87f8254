//! Bollard-backed `ContainerRuntimeAdapter`.
//!
//! Grounded closely on the teacher's `docker::service::DockerService` and
//! `environment::docker::{environment,power,stats}`: the same HostConfig /
//! Config construction, the same 404-as-success treatment on stop/remove,
//! and the same delta-based CPU/memory/network stats calculation.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, RestartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;

use super::{
    ContainerRuntimeAdapter, ContainerSpec, Inspection, LogLineStream, LogStream, ObservedStatus,
    RawStats, RuntimeError, RuntimeResult, ThrottlingStats,
};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect(socket: &str) -> RuntimeResult<Self> {
        let client = if socket.is_empty() {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn is_not_found(err: &BollardError) -> bool {
        matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404)
    }
}

fn map_err(err: BollardError) -> RuntimeError {
    if DockerRuntime::is_not_found(&err) {
        RuntimeError::NotFound(err.to_string())
    } else {
        RuntimeError::Daemon(err.to_string())
    }
}

#[async_trait::async_trait]
impl ContainerRuntimeAdapter for DockerRuntime {
    async fn ping_once(&self) -> RuntimeResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn ensure_network(&self, name: &str) -> RuntimeResult<()> {
        let existing = self
            .client
            .list_networks::<String>(None)
            .await
            .map_err(map_err)?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }
        self.client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{}/tcp", spec.container_port),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", spec.container_port), HashMap::new());

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some((spec.cpu_cores * 1_000_000_000.0) as i64),
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(bollard::models::RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            mounts: Some(vec![Mount {
                source: Some(spec.workspace_bind.source.clone()),
                target: Some(spec.workspace_bind.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(spec.workspace_bind.read_only),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_err)?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(map_err)
    }

    async fn stop(&self, id: &str, grace_period_secs: u64) -> RuntimeResult<()> {
        let result = self
            .client
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace_period_secs as i64,
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if DockerRuntime::is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn restart(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .restart_container(id, Some(RestartContainerOptions { t: 10 }))
            .await
            .map_err(map_err)
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let result = self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if DockerRuntime::is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Inspection> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        let state = info.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| ObservedStatus::from(format!("{s:?}").as_str()))
            .unwrap_or(ObservedStatus::Unknown);
        Ok(Inspection {
            id: info.id.unwrap_or_default(),
            status,
            started_at: state
                .started_at
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            exit_code: state.exit_code,
        })
    }

    async fn stats(&self, id: &str) -> RuntimeResult<RawStats> {
        let mut stream = self.client.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Daemon("no stats returned".into()))?
            .map_err(map_err)?;

        let cpu = stats.cpu_stats;
        let memory = stats.memory_stats;
        let networks = stats.networks.unwrap_or_default();
        let (rx_bytes, tx_bytes, rx_packets, rx_errors) =
            networks.values().fold((0u64, 0u64, 0u64, 0u64), |acc, n| {
                (
                    acc.0 + n.rx_bytes,
                    acc.1 + n.tx_bytes,
                    acc.2 + n.rx_packets,
                    acc.3 + n.rx_errors,
                )
            });

        let (disk_read, disk_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .unwrap_or_default()
            .into_iter()
            .fold((0u64, 0u64), |acc, entry| {
                let op = entry.op.to_lowercase();
                if op == "read" {
                    (acc.0 + entry.value, acc.1)
                } else if op == "write" {
                    (acc.0, acc.1 + entry.value)
                } else {
                    acc
                }
            });

        Ok(RawStats {
            cpu_total_usage_ns: cpu.cpu_usage.total_usage,
            system_cpu_usage_ns: cpu.system_cpu_usage.unwrap_or(0),
            online_cpus: cpu.online_cpus.unwrap_or(1) as u64,
            throttling: ThrottlingStats {
                periods: cpu.throttling_data.periods,
                throttled_periods: cpu.throttling_data.throttled_periods,
                throttled_time_ns: cpu.throttling_data.throttled_time,
            },
            memory_usage_bytes: memory.usage.unwrap_or(0),
            memory_limit_bytes: memory.limit.unwrap_or(0),
            memory_cache_bytes: memory
                .stats
                .as_ref()
                .and_then(|s| s.cache)
                .unwrap_or(0),
            rx_bytes,
            tx_bytes,
            rx_packets,
            rx_errors,
            disk_read_bytes: disk_read,
            disk_write_bytes: disk_write,
            pids: stats.pids_stats.current.unwrap_or(0),
            at: Utc::now(),
        })
    }

    async fn list_by_label(&self, label: &str) -> RuntimeResult<Vec<Inspection>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;
        Ok(summaries
            .into_iter()
            .map(|c| Inspection {
                id: c.id.unwrap_or_default(),
                status: c
                    .state
                    .as_deref()
                    .map(ObservedStatus::from)
                    .unwrap_or(ObservedStatus::Unknown),
                started_at: None,
                exit_code: None,
            })
            .collect())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<String> {
        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err)?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await.map_err(map_err)?
        {
            while let Some(Ok(msg)) = output.next().await {
                collected.push_str(&msg.to_string());
            }
        }
        Ok(collected)
    }

    async fn log_lines(&self, id: &str) -> RuntimeResult<LogLineStream> {
        let stream = self.client.logs(
            id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "0".to_string(),
                ..Default::default()
            }),
        );

        let lines = stream.flat_map(|chunk| {
            let items: Vec<RuntimeResult<(LogStream, String)>> = match chunk {
                Ok(LogOutput::StdOut { message }) => split_lines(&message, LogStream::Stdout),
                Ok(LogOutput::StdErr { message }) => split_lines(&message, LogStream::Stderr),
                Ok(LogOutput::Console { message }) => split_lines(&message, LogStream::Stdout),
                Ok(LogOutput::StdIn { .. }) => vec![],
                Err(e) => vec![Err(map_err(e))],
            };
            tokio_stream::iter(items)
        });

        Ok(Box::pin(lines))
    }
}

fn split_lines(bytes: &[u8], stream: LogStream) -> Vec<RuntimeResult<(LogStream, String)>> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| Ok((stream, line.to_string())))
        .collect()
}
