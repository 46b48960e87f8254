//! C8 — Metrics Pipeline.
//!
//! Collect, store, stream. Grounded on the teacher's
//! `environment::docker::stats` (delta-based CPU/network/disk math) and
//! `events::bus::EventBus` (fan-out shape reused from C7).

pub mod collector;
pub mod store;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Runtime(#[from] crate::runtime::RuntimeError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleInterval {
    Fast,
    Medium,
    Slow,
}

impl SampleInterval {
    pub const ALL: [SampleInterval; 3] =
        [SampleInterval::Fast, SampleInterval::Medium, SampleInterval::Slow];

    pub fn default_secs(self, config: &crate::config::MetricsConfiguration) -> u64 {
        match self {
            SampleInterval::Fast => config.fast_interval_secs,
            SampleInterval::Medium => config.medium_interval_secs,
            SampleInterval::Slow => config.slow_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Raw,
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    Day,
}

impl Resolution {
    /// Bucket width in seconds; `Raw` has no bucketing.
    pub fn bucket_secs(self) -> Option<i64> {
        match self {
            Resolution::Raw => None,
            Resolution::Minute => Some(60),
            Resolution::FiveMinute => Some(5 * 60),
            Resolution::FifteenMinute => Some(15 * 60),
            Resolution::Hour => Some(3600),
            Resolution::Day => Some(86_400),
        }
    }

    pub const AGGREGATED: [Resolution; 5] = [
        Resolution::Minute,
        Resolution::FiveMinute,
        Resolution::FifteenMinute,
        Resolution::Hour,
        Resolution::Day,
    ];
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricFields {
    pub cpu_percent: f64,
    pub memory_usage_bytes: f64,
    pub memory_usable_bytes: f64,
    pub network_rx_bps: f64,
    pub network_tx_bps: f64,
    pub disk_read_bps: f64,
    pub disk_write_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub container_id: String,
    pub interval: SampleInterval,
    pub at: DateTime<Utc>,
    pub fields: MetricFields,
    pub throttled_periods: u64,
    pub throttled_time_ns: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AggregatedPoint {
    pub bucket_start_ms: i64,
    pub avg: MetricFields,
    pub min: MetricFields,
    pub max: MetricFields,
    pub count: u64,
}

/// Per-field subset filter used by metric subscriptions, spec section 4.8:
/// `{cpu, memory, network, disk}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricFilter {
    pub cpu: bool,
    pub memory: bool,
    pub network: bool,
    pub disk: bool,
}

impl MetricFilter {
    pub fn all() -> Self {
        Self {
            cpu: true,
            memory: true,
            network: true,
            disk: true,
        }
    }
}
