//! Metric subscriptions: per-container fan-out with history replay, the
//! same shape as the log pipeline's subscriber management (C7), filtered by
//! interval and metric-kind subset instead of level/stream.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;

use super::store::{MetricsStore, QueryResult};
use super::{MetricFields, MetricFilter, MetricSample, Resolution, SampleInterval};

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;
const HISTORY_CHUNK_SIZE: usize = 10;
const HISTORY_CHUNK_GAP: Duration = Duration::from_millis(50);
const SUBSCRIPTION_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct MetricSubscription {
    pub id: String,
    pub container_id: String,
    pub interval: SampleInterval,
    pub filter: MetricFilter,
    pub sender: mpsc::Sender<MetricSample>,
    pub last_delivered: RwLock<DateTime<Utc>>,
    pub errors: std::sync::atomic::AtomicU64,
}

/// A metric filter is a field-visibility subset of `{cpu, memory, network,
/// disk}`: an empty set (no category selected) means "no preference" and
/// every field passes through. Otherwise fields outside the requested
/// categories are zeroed before delivery rather than dropping the sample.
fn apply_filter(filter: &MetricFilter, fields: MetricFields) -> MetricFields {
    if !filter.cpu && !filter.memory && !filter.network && !filter.disk {
        return fields;
    }
    MetricFields {
        cpu_percent: if filter.cpu { fields.cpu_percent } else { 0.0 },
        memory_usage_bytes: if filter.memory { fields.memory_usage_bytes } else { 0.0 },
        memory_usable_bytes: if filter.memory { fields.memory_usable_bytes } else { 0.0 },
        network_rx_bps: if filter.network { fields.network_rx_bps } else { 0.0 },
        network_tx_bps: if filter.network { fields.network_tx_bps } else { 0.0 },
        disk_read_bps: if filter.disk { fields.disk_read_bps } else { 0.0 },
        disk_write_bps: if filter.disk { fields.disk_write_bps } else { 0.0 },
    }
}

pub struct MetricStream {
    store: Arc<MetricsStore>,
    subscriptions: DashMap<String, Arc<MetricSubscription>>,
}

impl MetricStream {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self {
            store,
            subscriptions: DashMap::new(),
        }
    }

    /// Registers a subscriber for `container_id`/`interval`. With
    /// `include_history`, the last hour of raw samples is replayed in
    /// chunks of 10 with a 50ms gap.
    pub fn subscribe(
        &self,
        container_id: &str,
        interval: SampleInterval,
        filter: MetricFilter,
        include_history: bool,
    ) -> (String, mpsc::Receiver<MetricSample>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = Uuid::new_v4().to_string();
        let history_filter = filter.clone();
        let subscription = Arc::new(MetricSubscription {
            id: id.clone(),
            container_id: container_id.to_string(),
            interval,
            filter,
            sender: tx.clone(),
            last_delivered: RwLock::new(Utc::now()),
            errors: Default::default(),
        });
        self.subscriptions.insert(id.clone(), subscription);

        if include_history {
            let since = Utc::now() - ChronoDuration::hours(1);
            let history = match self.store.query(container_id, Some(since), None, Resolution::Raw, usize::MAX) {
                QueryResult::Raw(samples) => samples.into_iter().filter(|s| s.interval == interval).collect(),
                QueryResult::Aggregated(_) => Vec::new(),
            };
            tokio::spawn(async move {
                let history: Vec<MetricSample> = history;
                for chunk in history.chunks(HISTORY_CHUNK_SIZE) {
                    for sample in chunk {
                        let delivered = MetricSample {
                            fields: apply_filter(&history_filter, sample.fields),
                            ..sample.clone()
                        };
                        if tx.send(delivered).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(HISTORY_CHUNK_GAP).await;
                }
            });
        }

        (id, rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscriptions.remove(id);
    }

    /// Routes a freshly collected sample to subscribers whose interval
    /// matches, redacting fields outside each subscriber's metric filter.
    /// Slow subscribers are terminated as in C7.
    pub fn route(&self, sample: &MetricSample) {
        let mut terminated = Vec::new();
        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if sub.container_id != sample.container_id || sub.interval != sample.interval {
                continue;
            }
            let delivered = MetricSample {
                fields: apply_filter(&sub.filter, sample.fields),
                ..sample.clone()
            };
            match sub.sender.try_send(delivered) {
                Ok(()) => *sub.last_delivered.write() = Utc::now(),
                Err(_) => {
                    sub.errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    terminated.push(sub.id.clone());
                }
            }
        }
        for id in terminated {
            self.subscriptions.remove(&id);
        }
    }

    pub fn sweep_inactive(&self) -> usize {
        let mut stale = Vec::new();
        for entry in self.subscriptions.iter() {
            let idle = Utc::now().signed_duration_since(*entry.value().last_delivered.read());
            if idle.num_seconds() as u64 > SUBSCRIPTION_INACTIVITY_TIMEOUT.as_secs() {
                stale.push(entry.key().clone());
            }
        }
        let count = stale.len();
        for id in stale {
            self.subscriptions.remove(&id);
        }
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricFields;

    fn sample(container: &str, interval: SampleInterval) -> MetricSample {
        MetricSample {
            container_id: container.to_string(),
            interval,
            at: Utc::now(),
            fields: MetricFields {
                cpu_percent: 5.0,
                ..Default::default()
            },
            throttled_periods: 0,
            throttled_time_ns: 0,
            pids: 1,
        }
    }

    #[tokio::test]
    async fn route_delivers_only_matching_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetricsStore::new(dir.path().to_path_buf()));
        let stream = MetricStream::new(store);
        let (_id, mut rx) = stream.subscribe("c1", SampleInterval::Fast, MetricFilter::all(), false);
        stream.route(&sample("c1", SampleInterval::Fast));
        stream.route(&sample("c1", SampleInterval::Slow));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
