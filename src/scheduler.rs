//! Generic interval-job runner.
//!
//! Powers the index-refresh (C7), aggregation and retention (C8), and
//! health-check (C9) loops. Grounded on the teacher's `cron::scheduler`:
//! each job is a named, cancellable `tokio::time::interval` loop, with
//! per-job run statistics and panics caught rather than propagated.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub run_count: u64,
    pub failure_count: u64,
    pub last_duration_ms: u64,
}

pub struct JobHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Schedules `task` to run every `interval`, starting after the first tick
/// unless `run_immediately` is set. Returns a handle that cancels the loop
/// when dropped... no — cancellation is explicit via `JobHandle::cancel`,
/// matching the teacher's scheduler (a forgotten handle just keeps running).
pub fn schedule<F, Fut>(
    name: impl Into<String>,
    interval: Duration,
    run_immediately: bool,
    task: F,
) -> (JobHandle, Arc<RwLock<JobStats>>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let cancelled = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(RwLock::new(JobStats::default()));

    let handle = JobHandle {
        name: name.clone(),
        cancelled: cancelled.clone(),
    };

    let loop_cancelled = cancelled.clone();
    let loop_stats = stats.clone();
    let loop_name = name.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        if !run_immediately {
            ticker.tick().await;
        }
        loop {
            ticker.tick().await;
            if loop_cancelled.load(Ordering::SeqCst) {
                debug!(job = %loop_name, "job cancelled");
                return;
            }

            let start = Instant::now();
            let result = tokio::spawn(task()).await;
            let mut stats = loop_stats.write().await;
            stats.run_count += 1;
            stats.last_duration_ms = start.elapsed().as_millis() as u64;
            if let Err(e) = result {
                stats.failure_count += 1;
                error!(job = %loop_name, error = %e, "job panicked");
            }
        }
    });

    (handle, stats)
}

/// One-shot delayed task, used for C9's RESTART grace period.
pub fn schedule_once<F, Fut>(delay: Duration, task: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task().await;
    });
}

/// Retained for parity with the registry-style usage the teacher's
/// `CronRegistry` demonstrates: a handful of named handles collected so they
/// can all be cancelled together on shutdown.
pub struct JobRegistry {
    handles: Vec<JobHandle>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self { handles: Vec::new() }
    }

    pub fn push(&mut self, handle: JobHandle) {
        self.handles.push(handle);
    }

    pub fn cancel_all(&self) {
        for handle in &self.handles {
            warn!(job = handle.name(), "cancelling background job");
            handle.cancel();
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_at_least_twice_within_window() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let (handle, _stats) = schedule("test", Duration::from_millis(30), false, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
