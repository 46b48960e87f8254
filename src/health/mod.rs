//! C9 — Health & Recovery Engine.
//!
//! Named component probes on a fixed interval, per-component Health
//! Records, and an error-kind-driven recovery strategy table. Grounded on
//! the teacher's `server::manager::Manager::health_check` for the
//! probe-then-record shape, generalized to the spec's four recovery
//! strategies and per-component serialization.

pub mod probes;
pub mod recovery;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use recovery::{RecoveryAttempt, RecoveryStrategy, Recoverer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Error,
    Critical,
    Unknown,
}

/// Error kinds used to pick a recovery strategy (spec section 4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Daemon,
    Network,
    Filesystem,
    Port,
    Config,
    Resource,
    System,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub state: HealthState,
    pub response_time_ms: u64,
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl ProbeResult {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            state: HealthState::Healthy,
            response_time_ms,
            metadata: serde_json::Value::Null,
            error_kind: None,
        }
    }

    pub fn unhealthy(state: HealthState, response_time_ms: u64, kind: ErrorKind, reason: &str) -> Self {
        Self {
            state,
            response_time_ms,
            metadata: serde_json::json!({ "reason": reason }),
            error_kind: Some(kind),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> ProbeResult;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub component: String,
    pub state: HealthState,
    pub consecutive_failures: u64,
    pub total_checks: u64,
    pub total_failures: u64,
    pub avg_response_time_ms: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_metadata: serde_json::Value,
}

impl HealthRecord {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            state: HealthState::Unknown,
            consecutive_failures: 0,
            total_checks: 0,
            total_failures: 0,
            avg_response_time_ms: 0.0,
            last_checked: None,
            last_metadata: serde_json::Value::Null,
        }
    }

    fn apply(&mut self, probe: &ProbeResult) {
        self.total_checks += 1;
        if probe.state == HealthState::Healthy {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.total_failures += 1;
        }
        // Exponential moving average, alpha = 0.2.
        self.avg_response_time_ms = if self.total_checks == 1 {
            probe.response_time_ms as f64
        } else {
            0.8 * self.avg_response_time_ms + 0.2 * probe.response_time_ms as f64
        };
        self.state = probe.state;
        self.last_checked = Some(Utc::now());
        self.last_metadata = probe.metadata.clone();
    }

    fn error_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_checks as f64
        }
    }

    /// `consecutive-failures >= 3 || error-rate >= 0.10 || response-time >
    /// 5000ms` (spec section 4.9).
    fn needs_recovery(&self) -> bool {
        self.consecutive_failures >= 3 || self.error_rate() >= 0.10 || self.avg_response_time_ms > 5000.0
    }
}

pub struct HealthEngine {
    probes: Vec<Arc<dyn HealthProbe>>,
    records: DashMap<String, RwLock<HealthRecord>>,
    in_progress: Mutex<HashSet<String>>,
    recoverer: Arc<Recoverer>,
}

impl HealthEngine {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, recoverer: Arc<Recoverer>) -> Self {
        let records = DashMap::new();
        for probe in &probes {
            records.insert(probe.name().to_string(), RwLock::new(HealthRecord::new(probe.name())));
        }
        Self {
            probes,
            records,
            in_progress: Mutex::new(HashSet::new()),
            recoverer,
        }
    }

    pub fn record(&self, component: &str) -> Option<HealthRecord> {
        self.records.get(component).map(|r| r.read().clone())
    }

    pub fn all_records(&self) -> Vec<HealthRecord> {
        self.records.iter().map(|e| e.value().read().clone()).collect()
    }

    pub fn overall_state(&self) -> HealthState {
        let records = self.all_records();
        if records.iter().any(|r| r.state == HealthState::Critical) {
            HealthState::Critical
        } else if records.iter().any(|r| r.state == HealthState::Error) {
            HealthState::Error
        } else if records.iter().any(|r| r.state == HealthState::Warning) {
            HealthState::Warning
        } else if records.iter().all(|r| r.state == HealthState::Healthy) {
            HealthState::Healthy
        } else {
            HealthState::Unknown
        }
    }

    /// Runs every probe once, updates its Health Record, and triggers
    /// recovery where warranted. Called on the health task's tick (default
    /// 30s) and can also be invoked on-demand.
    pub async fn run_once(&self) {
        for probe in self.probes.clone() {
            let started = Instant::now();
            let result = probe.check().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let mut result = result;
            if result.response_time_ms == 0 {
                result.response_time_ms = elapsed_ms;
            }

            let needs_recovery = {
                let entry = self
                    .records
                    .entry(probe.name().to_string())
                    .or_insert_with(|| RwLock::new(HealthRecord::new(probe.name())));
                let mut record = entry.write();
                record.apply(&result);
                record.needs_recovery()
            };

            if needs_recovery {
                self.trigger_recovery(probe.name(), result.error_kind.unwrap_or(ErrorKind::Other))
                    .await;
            }
        }
    }

    /// Serialized per component via an in-progress set; a concurrent
    /// trigger for the same component is a no-op (spec section 4.9:
    /// "already in progress"). When `component` names one of this engine's
    /// own probes, a RETRY strategy re-invokes that probe rather than
    /// guessing at success.
    pub async fn trigger_recovery(&self, component: &str, kind: ErrorKind) -> Option<RecoveryAttempt> {
        {
            let mut guard = self.in_progress.lock();
            if guard.contains(component) {
                return None;
            }
            guard.insert(component.to_string());
        }
        let probe = self.probes.iter().find(|p| p.name() == component).cloned();
        let attempt = self.recoverer.recover(component, kind, probe).await;
        self.in_progress.lock().remove(component);
        Some(attempt)
    }

    pub fn recovery_stats(&self) -> recovery::RecoveryStats {
        self.recoverer.stats()
    }
}

pub fn probe_interval() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;
    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        fn name(&self) -> &'static str {
            "daemon"
        }
        async fn check(&self) -> ProbeResult {
            ProbeResult::healthy(5)
        }
    }

    struct AlwaysFailing;
    #[async_trait]
    impl HealthProbe for AlwaysFailing {
        fn name(&self) -> &'static str {
            "network"
        }
        async fn check(&self) -> ProbeResult {
            ProbeResult::unhealthy(HealthState::Error, 10, ErrorKind::Network, "timeout")
        }
    }

    #[tokio::test]
    async fn consecutive_failures_trigger_recovery() {
        let recoverer = Arc::new(Recoverer::new());
        let engine = HealthEngine::new(vec![Arc::new(AlwaysFailing)], recoverer.clone());
        for _ in 0..3 {
            engine.run_once().await;
        }
        let record = engine.record("network").unwrap();
        assert!(record.consecutive_failures >= 3);
        assert!(recoverer.stats().total_attempts > 0);
    }

    #[tokio::test]
    async fn healthy_probe_never_recovers() {
        let recoverer = Arc::new(Recoverer::new());
        let engine = HealthEngine::new(vec![Arc::new(AlwaysHealthy)], recoverer.clone());
        engine.run_once().await;
        assert_eq!(engine.record("daemon").unwrap().state, HealthState::Healthy);
        assert_eq!(recoverer.stats().total_attempts, 0);
    }

    #[test]
    fn overall_state_prefers_worst() {
        let engine = HealthEngine::new(vec![], Arc::new(Recoverer::new()));
        engine
            .records
            .insert("a".into(), RwLock::new(HealthRecord { state: HealthState::Warning, ..HealthRecord::new("a") }));
        engine
            .records
            .insert("b".into(), RwLock::new(HealthRecord { state: HealthState::Critical, ..HealthRecord::new("b") }));
        assert_eq!(engine.overall_state(), HealthState::Critical);
    }
}
