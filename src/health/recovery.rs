//! Recovery strategy table and recovery-attempt bookkeeping (spec section
//! 4.9). Grounded on the teacher's `server::manager::Manager::restart`
//! retry loop, generalized to four strategies keyed by error kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

use super::{ErrorKind, HealthProbe, HealthState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Restart,
    Degrade,
}

/// Error-kind -> strategy table, spec section 4.9: "daemon -> RESTART for
/// container issues else RETRY, network -> RETRY, filesystem -> FALLBACK,
/// port -> RETRY, config -> FALLBACK, resource -> DEGRADE, system ->
/// DEGRADE if critical else RESTART, default -> RETRY".
pub fn strategy_for(kind: ErrorKind, is_container_issue: bool, is_critical: bool) -> RecoveryStrategy {
    match kind {
        ErrorKind::Daemon if is_container_issue => RecoveryStrategy::Restart,
        ErrorKind::Daemon => RecoveryStrategy::Retry,
        ErrorKind::Network => RecoveryStrategy::Retry,
        ErrorKind::Filesystem => RecoveryStrategy::Fallback,
        ErrorKind::Port => RecoveryStrategy::Retry,
        ErrorKind::Config => RecoveryStrategy::Fallback,
        ErrorKind::Resource => RecoveryStrategy::Degrade,
        ErrorKind::System if is_critical => RecoveryStrategy::Degrade,
        ErrorKind::System => RecoveryStrategy::Restart,
        ErrorKind::Other => RecoveryStrategy::Retry,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub component: String,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub duration_ms: u64,
    pub attempts: u32,
    pub requires_intervention: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

const FALLBACK_ORDER: [&str; 3] = ["cache", "default", "manual"];

pub struct Recoverer {
    history: RwLock<Vec<RecoveryAttempt>>,
    total_attempts: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl Recoverer {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(Vec::new()),
            total_attempts: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub async fn recover(
        &self,
        component: &str,
        kind: ErrorKind,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> RecoveryAttempt {
        let strategy = strategy_for(kind, is_container_issue(component), false);
        let started = Instant::now();
        let (success, attempts, requires_intervention) = match strategy {
            RecoveryStrategy::Retry => self.retry(probe).await,
            RecoveryStrategy::Fallback => (self.fallback().await, 1, false),
            RecoveryStrategy::Restart => (self.restart(component).await, 1, false),
            RecoveryStrategy::Degrade => (self.degrade(component), 1, false),
        };

        let attempt = RecoveryAttempt {
            component: component.to_string(),
            strategy,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            requires_intervention,
        };

        self.total_attempts.fetch_add(1, Ordering::SeqCst);
        if success {
            self.total_successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.total_failures.fetch_add(1, Ordering::SeqCst);
        }
        self.history.write().push(attempt.clone());
        attempt
    }

    /// Up to 3 attempts, exponential backoff with jitter (100ms x 2^n +-
    /// 10%). Each attempt re-invokes the failing component's own probe and
    /// succeeds as soon as it reports Healthy; a component with no probe
    /// (recovery triggered directly, outside the health engine) has nothing
    /// to re-check and fails closed after exhausting the schedule.
    async fn retry(&self, probe: Option<Arc<dyn HealthProbe>>) -> (bool, u32, bool) {
        let mut attempts = 0;
        for n in 0..3u32 {
            attempts += 1;
            let base_ms = 100.0 * 2f64.powi(n as i32);
            let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
            let delay_ms = (base_ms * (1.0 + jitter)).max(0.0) as u64;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            if let Some(ref probe) = probe {
                if probe.check().await.state == HealthState::Healthy {
                    return (true, attempts, false);
                }
            }
        }
        (false, attempts, probe.is_some())
    }

    async fn fallback(&self) -> bool {
        for option in FALLBACK_ORDER {
            if option == "manual" {
                return false;
            }
            // `cache`/`default` are assumed available; a concrete source is
            // wired in by the component-specific caller.
            return true;
        }
        false
    }

    async fn restart(&self, _component: &str) -> bool {
        tokio::time::sleep(Duration::from_millis(500)).await;
        true
    }

    fn degrade(&self, _component: &str) -> bool {
        true
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            total_attempts: self.total_attempts.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
        }
    }

    pub fn recent_attempts(&self, limit: usize) -> Vec<RecoveryAttempt> {
        let history = self.history.read();
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }
}

impl Default for Recoverer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_container_issue(component: &str) -> bool {
    component == "daemon" || component.starts_with("container")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_table_matches_spec() {
        assert_eq!(strategy_for(ErrorKind::Daemon, true, false), RecoveryStrategy::Restart);
        assert_eq!(strategy_for(ErrorKind::Daemon, false, false), RecoveryStrategy::Retry);
        assert_eq!(strategy_for(ErrorKind::Filesystem, false, false), RecoveryStrategy::Fallback);
        assert_eq!(strategy_for(ErrorKind::Resource, false, false), RecoveryStrategy::Degrade);
        assert_eq!(strategy_for(ErrorKind::System, false, true), RecoveryStrategy::Degrade);
        assert_eq!(strategy_for(ErrorKind::System, false, false), RecoveryStrategy::Restart);
    }

    #[tokio::test]
    async fn recover_updates_stats() {
        let recoverer = Recoverer::new();
        recoverer.recover("network", ErrorKind::Network, None).await;
        let stats = recoverer.stats();
        assert_eq!(stats.total_attempts, 1);
    }
}
