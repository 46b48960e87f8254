//! Multi-rate sampler: one task per (container, interval), each polling
//! `ContainerRuntimeAdapter::stats` and turning consecutive snapshots into a
//! `MetricSample` via delta math. Grounded on the teacher's
//! `environment::docker::stats::calculate_cpu_percent` for the CPU formula.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::store::MetricsStore;
use super::{MetricFields, MetricSample, SampleInterval};
use crate::config::MetricsConfiguration;
use crate::events::{Event, EventBus};
use crate::runtime::{ContainerRuntimeAdapter, RawStats};

fn compute_fields(prev: &RawStats, curr: &RawStats) -> MetricFields {
    let delta_total = curr.cpu_total_usage_ns.saturating_sub(prev.cpu_total_usage_ns) as f64;
    let delta_system = curr.system_cpu_usage_ns.saturating_sub(prev.system_cpu_usage_ns) as f64;
    let cpu_percent = if delta_system > 0.0 {
        (delta_total / delta_system) * curr.online_cpus.max(1) as f64 * 100.0
    } else {
        0.0
    };

    let elapsed = (curr.at - prev.at).num_milliseconds().max(1) as f64 / 1000.0;
    let rate = |curr_v: u64, prev_v: u64| (curr_v.saturating_sub(prev_v) as f64) / elapsed;

    MetricFields {
        cpu_percent,
        memory_usage_bytes: (curr.memory_usage_bytes.saturating_sub(curr.memory_cache_bytes)) as f64,
        memory_usable_bytes: (curr.memory_usage_bytes.saturating_sub(curr.memory_cache_bytes)) as f64,
        network_rx_bps: rate(curr.rx_bytes, prev.rx_bytes),
        network_tx_bps: rate(curr.tx_bytes, prev.tx_bytes),
        disk_read_bps: rate(curr.disk_read_bytes, prev.disk_read_bytes),
        disk_write_bps: rate(curr.disk_write_bytes, prev.disk_write_bytes),
    }
}

pub struct Collector {
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    store: Arc<MetricsStore>,
    events: EventBus,
    config: MetricsConfiguration,
    tasks: DashMap<(String, SampleInterval), CancellationToken>,
}

impl Collector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeAdapter>,
        store: Arc<MetricsStore>,
        events: EventBus,
        config: MetricsConfiguration,
    ) -> Self {
        Self {
            runtime,
            store,
            events,
            config,
            tasks: DashMap::new(),
        }
    }

    /// Attaches all three samplers for `container_id` atomically.
    pub fn attach(self: &Arc<Self>, container_id: &str) {
        for interval in SampleInterval::ALL {
            let key = (container_id.to_string(), interval);
            if self.tasks.contains_key(&key) {
                continue;
            }
            let cancel = CancellationToken::new();
            self.tasks.insert(key.clone(), cancel.clone());
            let this = self.clone();
            let container_id = container_id.to_string();
            tokio::spawn(async move {
                this.run_sampler(container_id, interval, cancel).await;
            });
        }
    }

    pub fn detach(&self, container_id: &str) {
        for interval in SampleInterval::ALL {
            if let Some((_, cancel)) = self.tasks.remove(&(container_id.to_string(), interval)) {
                cancel.cancel();
            }
        }
    }

    async fn run_sampler(
        &self,
        container_id: String,
        interval: SampleInterval,
        cancel: CancellationToken,
    ) {
        let period = Duration::from_secs(interval.default_secs(&self.config).max(1));
        let mut ticker = tokio::time::interval(period);
        let mut previous: Option<RawStats> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let stats = match self.runtime.stats(&container_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::debug!(container = %container_id, error = %e, "stats sample failed");
                    continue;
                }
            };

            if let Some(ref prev) = previous {
                let sample = MetricSample {
                    container_id: container_id.clone(),
                    interval,
                    at: stats.at,
                    fields: compute_fields(prev, &stats),
                    throttled_periods: stats.throttling.throttled_periods,
                    throttled_time_ns: stats.throttling.throttled_time_ns,
                    pids: stats.pids,
                };
                self.store.ingest(sample.clone());
                self.events.publish(Event::Metric {
                    container_id: container_id.clone(),
                    sample,
                });
            }
            previous = Some(stats);
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_attached(&self, container_id: &str) -> bool {
        SampleInterval::ALL
            .iter()
            .any(|interval| self.tasks.contains_key(&(container_id.to_string(), *interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_at(at: chrono::DateTime<Utc>, total: u64, system: u64, rx: u64) -> RawStats {
        RawStats {
            cpu_total_usage_ns: total,
            system_cpu_usage_ns: system,
            online_cpus: 2,
            rx_bytes: rx,
            at,
            ..Default::default()
        }
    }

    #[test]
    fn cpu_percent_uses_delta_ratio() {
        let t0 = Utc::now();
        let prev = stats_at(t0, 1_000_000, 10_000_000, 0);
        let curr = stats_at(t0 + chrono::Duration::seconds(1), 1_200_000, 12_000_000, 0);
        let fields = compute_fields(&prev, &curr);
        // delta_total/delta_system * online_cpus * 100 = (200000/2000000)*2*100 = 20
        assert!((fields.cpu_percent - 20.0).abs() < 0.001);
    }

    #[test]
    fn network_rate_uses_elapsed_seconds() {
        let t0 = Utc::now();
        let prev = stats_at(t0, 0, 0, 1000);
        let curr = stats_at(t0 + chrono::Duration::seconds(2), 0, 0, 5000);
        let fields = compute_fields(&prev, &curr);
        assert!((fields.network_rx_bps - 2000.0).abs() < 0.001);
    }
}
