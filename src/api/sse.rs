//! Server-sent-event streams: live-tailing logs and metrics. Grounded on
//! the teacher's `server::handlers::events` SSE endpoint — one `mpsc`
//! channel bridged into an axum `Sse` response, a background task that
//! forwards pipeline output plus a periodic heartbeat, and unsubscribe on
//! drop.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::AppState;
use crate::error::ApiError;
use crate::logs::{LogFilter, LogLevel, StreamKind};
use crate::metrics::{MetricFilter, Resolution, SampleInterval};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BRIDGE_QUEUE_DEPTH: usize = 64;

fn json_event(name: &'static str, value: serde_json::Value) -> SseEvent {
    SseEvent::default().event(name).data(value.to_string())
}

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_tail")]
    pub tail: usize,
    #[serde(default = "default_true")]
    pub follow: bool,
    #[serde(default)]
    pub include_history: bool,
}

fn default_tail() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn stream_kind_from(value: &str) -> StreamKind {
    match value.to_lowercase().as_str() {
        "stderr" => StreamKind::Stderr,
        _ => StreamKind::Stdout,
    }
}

/// `GET /mcp/logs/:projectId/stream`. Event names follow spec section 6:
/// `connected`, `historical` (one chunked burst), per-line `log`, `error`,
/// and a 30s `heartbeat`.
pub async fn log_stream(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<LogStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let project = state
        .projects
        .get(&project_id)
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;
    let container_id = project
        .container_id
        .clone()
        .ok_or_else(|| ApiError::conflict("project has no running container"))?;

    let filter = LogFilter {
        level: query.level.as_deref().map(LogLevel::from_label),
        stream: query.stream.as_deref().map(stream_kind_from),
        substring: query.search.clone(),
        ..Default::default()
    };

    let history = if query.include_history {
        state.logs.history(&container_id, &filter, query.tail)
    } else {
        Vec::new()
    };

    let follow = query.follow;
    let (sub_id, mut entries) = state.logs.subscribe(&container_id, filter, false, 0);
    let logs = state.logs.clone();

    let (tx, rx) = mpsc::channel::<SseEvent>(BRIDGE_QUEUE_DEPTH);

    let _ = tx
        .send(json_event(
            "connected",
            json!({ "projectId": project_id, "containerId": container_id }),
        ))
        .await;

    tokio::spawn(async move {
        if !history.is_empty() {
            let _ = tx
                .send(json_event("historical", json!({ "entries": history })))
                .await;
        }

        if follow {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    entry = entries.recv() => {
                        match entry {
                            Some(entry) => {
                                if tx.send(json_event("log", json!(entry))).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = tx.send(json_event("error", json!({ "message": "log stream closed" }))).await;
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if tx.send(SseEvent::default().event("heartbeat").data("{}")).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        logs.unsubscribe(&sub_id);
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL)))
}

#[derive(Debug, Deserialize)]
pub struct MetricsStreamQuery {
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub metrics: Option<String>,
    #[serde(default)]
    pub include_history: bool,
}

fn parse_interval(value: Option<&str>) -> SampleInterval {
    match value.unwrap_or("fast") {
        "medium" => SampleInterval::Medium,
        "slow" => SampleInterval::Slow,
        _ => SampleInterval::Fast,
    }
}

fn parse_filter(value: Option<&str>) -> MetricFilter {
    match value {
        None => MetricFilter::all(),
        Some(csv) => {
            let mut filter = MetricFilter::default();
            for part in csv.split(',').map(str::trim) {
                match part {
                    "cpu" => filter.cpu = true,
                    "memory" => filter.memory = true,
                    "network" => filter.network = true,
                    "disk" => filter.disk = true,
                    _ => {}
                }
            }
            filter
        }
    }
}

/// `GET /api/metrics/:containerId/stream`. Event names follow spec section
/// 6: `stream_started`, `historical` (chunked, carries `isLast`), per-sample
/// `metrics`, `collector_started`/`collector_stopped`, `error`, `heartbeat`.
pub async fn metrics_stream(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Query(query): Query<MetricsStreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let interval = parse_interval(query.interval.as_deref());
    let filter = parse_filter(query.metrics.as_deref());

    let was_collecting = state.collector.is_attached(&container_id);
    if !was_collecting {
        state.collector.attach(&container_id);
    }

    let (sub_id, mut samples) = state.metrics_stream.subscribe(&container_id, interval, filter, false);
    let metrics_stream = state.metrics_stream.clone();

    let (tx, rx) = mpsc::channel::<SseEvent>(BRIDGE_QUEUE_DEPTH);

    let _ = tx
        .send(json_event(
            "stream_started",
            json!({ "containerId": container_id, "interval": interval }),
        ))
        .await;
    if !was_collecting {
        let _ = tx
            .send(json_event("collector_started", json!({ "containerId": container_id })))
            .await;
    }

    if query.include_history {
        let store = state.metrics_store.clone();
        let container_id = container_id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            const CHUNK: usize = 20;
            if let crate::metrics::store::QueryResult::Raw(history) =
                store.query(&container_id, None, None, Resolution::Raw, usize::MAX)
            {
                let chunks: Vec<_> = history.chunks(CHUNK).map(|c| c.to_vec()).collect();
                let total = chunks.len();
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let is_last = i + 1 == total;
                    if tx
                        .send(json_event("historical", json!({ "samples": chunk, "isLast": is_last })))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if total == 0 {
                    let _ = tx.send(json_event("historical", json!({ "samples": [], "isLast": true }))).await;
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                sample = samples.recv() => {
                    match sample {
                        Some(sample) => {
                            if tx.send(json_event("metrics", json!(sample))).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(json_event("error", json!({ "message": "metrics stream closed" }))).await;
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(SseEvent::default().event("heartbeat").data("{}")).await.is_err() {
                        break;
                    }
                }
            }
        }
        metrics_stream.unsubscribe(&sub_id);
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL))
}
