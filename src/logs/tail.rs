//! Tail task: reads a container's stdout/stderr from the runtime adapter
//! and pushes lines into the pipeline. Grounded on the teacher's
//! `environment::docker::power::attach_container`, which spawns a task per
//! attached container reading daemon output until the stream closes.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{LogPipeline, StreamKind};
use crate::runtime::{ContainerRuntimeAdapter, LogStream};

/// Spawns a tail task for `container_id`/`container_name`. The task ends
/// when the daemon's log stream closes or `cancel` fires; a new task is
/// started by the lifecycle manager when the container restarts.
pub fn spawn_tail(
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    pipeline: Arc<LogPipeline>,
    container_id: String,
    container_name: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tracing::debug!(container = %container_name, "tail task started");
        let mut stream = match runtime.log_lines(&container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(container = %container_name, error = %e, "failed to open log stream");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(container = %container_name, "tail task cancelled");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok((stream_kind, text))) => {
                            let kind = match stream_kind {
                                LogStream::Stdout => StreamKind::Stdout,
                                LogStream::Stderr => StreamKind::Stderr,
                            };
                            pipeline.ingest(&container_name, kind, text);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(container = %container_name, error = %e, "log stream error");
                        }
                        None => {
                            tracing::debug!(container = %container_name, "log stream closed");
                            return;
                        }
                    }
                }
            }
        }
    });
}
