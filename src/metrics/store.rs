//! Rolling time-series store: a high-resolution tier plus a
//! per-(container, resolution) aggregated tier, with periodic aggregation,
//! retention sweeps, and C1-backed persistence. Grounded on the teacher's
//! `store::persistence` snapshot-on-interval pattern, generalized from one
//! file to three (high-res, aggregated, cursors).

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{AggregatedPoint, MetricFields, MetricSample, Resolution};
use crate::store::{read_json, write_json, StoreResult};

const HIGH_RES_RETENTION_DAYS: i64 = 7;
const AGGREGATED_RETENTION_DAYS: i64 = 30;

fn scale(field: f64, factor: f64) -> f64 {
    field * factor
}

fn fields_combine(a: MetricFields, b: MetricFields, op: impl Fn(f64, f64) -> f64) -> MetricFields {
    MetricFields {
        cpu_percent: op(a.cpu_percent, b.cpu_percent),
        memory_usage_bytes: op(a.memory_usage_bytes, b.memory_usage_bytes),
        memory_usable_bytes: op(a.memory_usable_bytes, b.memory_usable_bytes),
        network_rx_bps: op(a.network_rx_bps, b.network_rx_bps),
        network_tx_bps: op(a.network_tx_bps, b.network_tx_bps),
        disk_read_bps: op(a.disk_read_bps, b.disk_read_bps),
        disk_write_bps: op(a.disk_write_bps, b.disk_write_bps),
    }
}

fn fields_scale(f: MetricFields, factor: f64) -> MetricFields {
    MetricFields {
        cpu_percent: scale(f.cpu_percent, factor),
        memory_usage_bytes: scale(f.memory_usage_bytes, factor),
        memory_usable_bytes: scale(f.memory_usable_bytes, factor),
        network_rx_bps: scale(f.network_rx_bps, factor),
        network_tx_bps: scale(f.network_tx_bps, factor),
        disk_read_bps: scale(f.disk_read_bps, factor),
        disk_write_bps: scale(f.disk_write_bps, factor),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HighResSnapshot {
    by_container: HashMap<String, Vec<MetricSample>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AggregatedSnapshot {
    by_container: HashMap<String, HashMap<String, Vec<AggregatedPoint>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CursorSnapshot {
    last_bucket_ms: HashMap<String, HashMap<String, i64>>,
}

fn resolution_key(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Raw => "raw",
        Resolution::Minute => "minute",
        Resolution::FiveMinute => "fiveMinute",
        Resolution::FifteenMinute => "fifteenMinute",
        Resolution::Hour => "hour",
        Resolution::Day => "day",
    }
}

fn resolution_from_str(value: &str) -> Option<&'static str> {
    Resolution::AGGREGATED
        .iter()
        .map(|r| resolution_key(*r))
        .find(|k| *k == value)
}

pub struct MetricsStore {
    high_res: DashMap<String, RwLock<Vec<MetricSample>>>,
    aggregated: DashMap<(String, &'static str), RwLock<Vec<AggregatedPoint>>>,
    cursors: DashMap<(String, &'static str), i64>,
    metrics_dir: PathBuf,
}

impl MetricsStore {
    pub fn new(metrics_dir: PathBuf) -> Self {
        Self {
            high_res: DashMap::new(),
            aggregated: DashMap::new(),
            cursors: DashMap::new(),
            metrics_dir,
        }
    }

    pub fn load(metrics_dir: PathBuf) -> StoreResult<Self> {
        let store = Self::new(metrics_dir);
        store.load_snapshots()?;
        Ok(store)
    }

    fn high_res_path(&self) -> PathBuf {
        self.metrics_dir.join("high_res.json")
    }
    fn aggregated_path(&self) -> PathBuf {
        self.metrics_dir.join("aggregated.json")
    }
    fn cursors_path(&self) -> PathBuf {
        self.metrics_dir.join("cursors.json")
    }

    fn load_snapshots(&self) -> StoreResult<()> {
        let high_res: HighResSnapshot = read_json(&self.high_res_path())?;
        for (container, samples) in high_res.by_container {
            self.high_res.insert(container, RwLock::new(samples));
        }
        let aggregated: AggregatedSnapshot = read_json(&self.aggregated_path())?;
        for (container, by_res) in aggregated.by_container {
            for (res, points) in by_res {
                if let Some(res) = resolution_from_str(&res) {
                    self.aggregated.insert((container.clone(), res), RwLock::new(points));
                }
            }
        }
        let cursors: CursorSnapshot = read_json(&self.cursors_path())?;
        for (container, by_res) in cursors.last_bucket_ms {
            for (res, ms) in by_res {
                if let Some(res) = resolution_from_str(&res) {
                    self.cursors.insert((container, res), ms);
                }
            }
        }
        Ok(())
    }

    /// Writes the three snapshot files. Called after every aggregation or
    /// cleanup round, and once more on clean shutdown (spec section 4.8).
    pub fn persist(&self) -> StoreResult<()> {
        let mut high_res = HighResSnapshot::default();
        for entry in self.high_res.iter() {
            high_res
                .by_container
                .insert(entry.key().clone(), entry.value().read().clone());
        }
        write_json(&self.high_res_path(), &high_res)?;

        let mut aggregated = AggregatedSnapshot::default();
        for entry in self.aggregated.iter() {
            let (container, res) = entry.key();
            aggregated
                .by_container
                .entry(container.clone())
                .or_default()
                .insert(res.to_string(), entry.value().read().clone());
        }
        write_json(&self.aggregated_path(), &aggregated)?;

        let mut cursors = CursorSnapshot::default();
        for entry in self.cursors.iter() {
            let (container, res) = entry.key();
            cursors
                .last_bucket_ms
                .entry(container.clone())
                .or_default()
                .insert(res.to_string(), *entry.value());
        }
        write_json(&self.cursors_path(), &cursors)?;
        Ok(())
    }

    /// Appends `sample` to the high-res tier for its container, keeping the
    /// array time-sorted (samples normally arrive in order; an out-of-order
    /// sample is inserted at its correct position).
    pub fn ingest(&self, sample: MetricSample) {
        let entry = self
            .high_res
            .entry(sample.container_id.clone())
            .or_insert_with(|| RwLock::new(Vec::new()));
        let mut guard = entry.write();
        let pos = guard.partition_point(|s| s.at <= sample.at);
        guard.insert(pos, sample);
    }

    /// Aggregates every high-res sample newer than each resolution's cursor
    /// into its bucket. Spec section 4.8: `floor(t/I)*I`, per-field
    /// {avg, min, max}, `count` = raw samples folded in.
    pub fn aggregate(&self) {
        for entry in self.high_res.iter() {
            let container = entry.key().clone();
            let samples = entry.value().read().clone();
            for resolution in Resolution::AGGREGATED {
                let bucket_secs = resolution.bucket_secs().unwrap();
                let res_key = resolution_key(resolution);
                let cursor = self
                    .cursors
                    .get(&(container.clone(), res_key))
                    .map(|v| *v)
                    .unwrap_or(0);

                let mut buckets: HashMap<i64, (MetricFields, MetricFields, MetricFields, u64)> =
                    HashMap::new();
                let mut max_ts = cursor;
                for sample in samples.iter().filter(|s| s.at.timestamp_millis() > cursor) {
                    let ts = sample.at.timestamp_millis();
                    max_ts = max_ts.max(ts);
                    let bucket_start = (ts / 1000 / bucket_secs) * bucket_secs * 1000;
                    let entry = buckets.entry(bucket_start).or_insert((
                        sample.fields,
                        sample.fields,
                        sample.fields,
                        0,
                    ));
                    entry.0 = fields_combine(entry.0, sample.fields, |a, b| a + b);
                    entry.1 = fields_combine(entry.1, sample.fields, f64::min);
                    entry.2 = fields_combine(entry.2, sample.fields, f64::max);
                    entry.3 += 1;
                }
                if buckets.is_empty() {
                    continue;
                }

                let agg_entry = self
                    .aggregated
                    .entry((container.clone(), res_key))
                    .or_insert_with(|| RwLock::new(Vec::new()));
                let mut guard = agg_entry.write();
                for (bucket_start, (sum, min, max, count)) in buckets {
                    match guard.iter().position(|p| p.bucket_start_ms == bucket_start) {
                        Some(idx) => {
                            // A bucket spanning more than one aggregation interval
                            // (Hour/Day at the default 300s aggregation_interval_secs)
                            // gets folded in here rather than overwritten, so later
                            // rounds don't erase earlier rounds' contribution.
                            let prev = guard[idx];
                            let prev_sum = fields_scale(prev.avg, prev.count as f64);
                            let merged_count = prev.count + count;
                            let merged_avg =
                                fields_scale(fields_combine(prev_sum, sum, |a, b| a + b), 1.0 / merged_count as f64);
                            guard[idx] = AggregatedPoint {
                                bucket_start_ms: bucket_start,
                                avg: merged_avg,
                                min: fields_combine(prev.min, min, f64::min),
                                max: fields_combine(prev.max, max, f64::max),
                                count: merged_count,
                            };
                        }
                        None => {
                            let avg = fields_scale(sum, 1.0 / count as f64);
                            let point = AggregatedPoint {
                                bucket_start_ms: bucket_start,
                                avg,
                                min,
                                max,
                                count,
                            };
                            let pos = guard.partition_point(|p| p.bucket_start_ms <= bucket_start);
                            guard.insert(pos, point);
                        }
                    }
                }
                self.cursors.insert((container.clone(), res_key), max_ts);
            }
        }
    }

    /// Drops high-res samples older than 7 days and aggregated points older
    /// than 30 days; removes containers with no data left in any tier.
    pub fn retention_sweep(&self) {
        let now = Utc::now();
        let high_res_cutoff = now - ChronoDuration::days(HIGH_RES_RETENTION_DAYS);
        let aggregated_cutoff_ms =
            (now - ChronoDuration::days(AGGREGATED_RETENTION_DAYS)).timestamp_millis();

        for entry in self.high_res.iter() {
            entry.value().write().retain(|s| s.at > high_res_cutoff);
        }
        for entry in self.aggregated.iter() {
            entry
                .value()
                .write()
                .retain(|p| p.bucket_start_ms > aggregated_cutoff_ms);
        }

        let empty_containers: Vec<String> = self
            .high_res
            .iter()
            .filter(|e| e.value().read().is_empty())
            .map(|e| e.key().clone())
            .filter(|container| {
                !self
                    .aggregated
                    .iter()
                    .any(|a| &a.key().0 == container && !a.value().read().is_empty())
            })
            .collect();
        for container in empty_containers {
            self.high_res.remove(&container);
            self.aggregated.retain(|k, _| &k.0 != &container);
            self.cursors.retain(|k, _| &k.0 != &container);
        }
    }

    /// `queryMetrics`: scans the chosen tier, filters by time range, and
    /// down-samples to `limit` by taking every step-th element.
    pub fn query(
        &self,
        container_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        resolution: Resolution,
        limit: usize,
    ) -> QueryResult {
        match resolution {
            Resolution::Raw => {
                let samples: Vec<MetricSample> = self
                    .high_res
                    .get(container_id)
                    .map(|e| e.read().clone())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|s| start.map(|t| s.at >= t).unwrap_or(true))
                    .filter(|s| end.map(|t| s.at <= t).unwrap_or(true))
                    .collect();
                QueryResult::Raw(downsample(samples, limit))
            }
            resolution => {
                let res_key = resolution_key(resolution);
                let points: Vec<AggregatedPoint> = self
                    .aggregated
                    .get(&(container_id.to_string(), res_key))
                    .map(|e| e.read().clone())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|p| {
                        start
                            .map(|t| p.bucket_start_ms >= t.timestamp_millis())
                            .unwrap_or(true)
                    })
                    .filter(|p| {
                        end.map(|t| p.bucket_start_ms <= t.timestamp_millis())
                            .unwrap_or(true)
                    })
                    .collect();
                QueryResult::Aggregated(downsample(points, limit))
            }
        }
    }

    pub fn has_data(&self, container_id: &str) -> bool {
        self.high_res
            .get(container_id)
            .map(|e| !e.read().is_empty())
            .unwrap_or(false)
    }
}

fn downsample<T: Clone>(items: Vec<T>, limit: usize) -> Vec<T> {
    if limit == 0 || items.len() <= limit {
        return items;
    }
    let step = (items.len() as f64 / limit as f64).ceil() as usize;
    items.into_iter().step_by(step.max(1)).collect()
}

#[derive(Debug, Clone)]
pub enum QueryResult {
    Raw(Vec<MetricSample>),
    Aggregated(Vec<AggregatedPoint>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SampleInterval;

    fn sample(container: &str, at: DateTime<Utc>, cpu: f64) -> MetricSample {
        MetricSample {
            container_id: container.to_string(),
            interval: SampleInterval::Fast,
            at,
            fields: MetricFields {
                cpu_percent: cpu,
                ..Default::default()
            },
            throttled_periods: 0,
            throttled_time_ns: 0,
            pids: 1,
        }
    }

    #[test]
    fn ingest_keeps_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path().to_path_buf());
        let t0 = Utc::now();
        store.ingest(sample("c1", t0 + ChronoDuration::seconds(2), 10.0));
        store.ingest(sample("c1", t0, 5.0));
        store.ingest(sample("c1", t0 + ChronoDuration::seconds(1), 7.0));
        let QueryResult::Raw(samples) = store.query("c1", None, None, Resolution::Raw, 100) else {
            panic!("expected raw");
        };
        assert_eq!(samples.len(), 3);
        assert!(samples[0].at <= samples[1].at && samples[1].at <= samples[2].at);
    }

    #[test]
    fn aggregate_builds_minute_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path().to_path_buf());
        let base = Utc::now();
        for i in 0..5 {
            store.ingest(sample("c1", base + ChronoDuration::seconds(i), 10.0));
        }
        store.aggregate();
        let QueryResult::Aggregated(points) =
            store.query("c1", None, None, Resolution::Minute, 100)
        else {
            panic!("expected aggregated");
        };
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 5);
        assert!((points[0].avg.cpu_percent - 10.0).abs() < 0.001);
    }

    #[test]
    fn downsample_respects_limit() {
        let items: Vec<i32> = (0..100).collect();
        let out = downsample(items, 10);
        assert!(out.len() <= 10);
    }

    #[test]
    fn persist_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path().to_path_buf());
        store.ingest(sample("c1", Utc::now(), 42.0));
        store.persist().unwrap();
        let reloaded = MetricsStore::load(dir.path().to_path_buf()).unwrap();
        assert!(reloaded.has_data("c1"));
    }
}
