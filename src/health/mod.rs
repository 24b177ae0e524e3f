/// Backend health and retry state machine
///
/// ```text
/// LIVE --(failures reach server_failure_limit, auto-eject on)--> EJECTED
/// EJECTED --(routing call at or after next_retry)--> LIVE
/// ```
///
/// A success resets the consecutive failure counter but never changes state.
/// With auto-eject off the counter is still tracked, it just never ejects.
use std::fmt;
use std::time::Duration;

use crate::config::PoolConfig;

/// Health status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Live,
    Ejected,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Live => write!(f, "live"),
            HealthStatus::Ejected => write!(f, "ejected"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a routable backend
    pub fn is_live(&self) -> bool {
        matches!(self, HealthStatus::Live)
    }
}

/// Pool-wide ejection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub auto_eject: bool,
    pub failure_limit: u32,
    pub retry_timeout: Duration,
}

impl From<&PoolConfig> for HealthPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            auto_eject: config.auto_eject_hosts,
            failure_limit: config.server_failure_limit,
            retry_timeout: config.server_retry_timeout(),
        }
    }
}

/// Outcome of feeding one event into a backend's health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Ejected { next_retry: u64 },
    Readmitted,
}

impl HealthTransition {
    /// Whether the owning pool's continuum is now stale
    pub fn changes_ring(&self) -> bool {
        !matches!(self, HealthTransition::Unchanged)
    }
}

/// Per-backend failure bookkeeping
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    status: HealthStatus,
    failure_count: u32,
    /// Earliest re-admission time in microseconds, 0 when not ejected
    next_retry: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one connect or I/O failure
    pub fn record_failure(&mut self, policy: &HealthPolicy, now_usec: u64) -> HealthTransition {
        self.failure_count = self.failure_count.saturating_add(1);

        if !policy.auto_eject
            || self.status == HealthStatus::Ejected
            || self.failure_count < policy.failure_limit
        {
            return HealthTransition::Unchanged;
        }

        self.status = HealthStatus::Ejected;
        self.next_retry = now_usec.saturating_add(policy.retry_timeout.as_micros() as u64);
        HealthTransition::Ejected {
            next_retry: self.next_retry,
        }
    }

    /// Count one successful exchange
    pub fn record_success(&mut self) {
        self.failure_count = 0;
    }

    /// Put an ejected backend back once its retry time has come
    pub fn try_readmit(&mut self, now_usec: u64) -> HealthTransition {
        if self.status != HealthStatus::Ejected || now_usec < self.next_retry {
            return HealthTransition::Unchanged;
        }

        self.status = HealthStatus::Live;
        self.failure_count = 0;
        self.next_retry = 0;
        HealthTransition::Readmitted
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn next_retry(&self) -> u64 {
        self.next_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(auto_eject: bool) -> HealthPolicy {
        HealthPolicy {
            auto_eject,
            failure_limit: 3,
            retry_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Live.to_string(), "live");
        assert_eq!(HealthStatus::Ejected.to_string(), "ejected");
        assert!(HealthStatus::Live.is_live());
        assert!(!HealthStatus::Ejected.is_live());
    }

    #[test]
    fn test_eject_after_failure_limit() {
        let policy = policy(true);
        let mut state = HealthState::new();

        assert_eq!(state.record_failure(&policy, 100), HealthTransition::Unchanged);
        assert_eq!(state.record_failure(&policy, 200), HealthTransition::Unchanged);
        assert!(state.is_live());

        let transition = state.record_failure(&policy, 300);
        assert_eq!(
            transition,
            HealthTransition::Ejected {
                next_retry: 300 + 10_000_000
            }
        );
        assert!(transition.changes_ring());
        assert_eq!(state.status(), HealthStatus::Ejected);
        assert_eq!(state.next_retry(), 10_000_300);

        // Further failures while ejected do not re-arm the retry.
        assert_eq!(state.record_failure(&policy, 400), HealthTransition::Unchanged);
        assert_eq!(state.next_retry(), 10_000_300);
    }

    #[test]
    fn test_success_resets_counter() {
        let policy = policy(true);
        let mut state = HealthState::new();

        state.record_failure(&policy, 1);
        state.record_failure(&policy, 2);
        state.record_success();
        assert_eq!(state.failure_count(), 0);

        state.record_failure(&policy, 3);
        state.record_failure(&policy, 4);
        assert!(state.is_live());
        assert_eq!(state.failure_count(), 2);
    }

    #[test]
    fn test_no_ejection_without_auto_eject() {
        let policy = policy(false);
        let mut state = HealthState::new();

        for now in 0..10 {
            assert_eq!(state.record_failure(&policy, now), HealthTransition::Unchanged);
        }
        assert!(state.is_live());
        assert_eq!(state.failure_count(), 10);
    }

    #[test]
    fn test_readmit_after_retry_timeout() {
        let policy = policy(true);
        let mut state = HealthState::new();
        for now in 0..3 {
            state.record_failure(&policy, now);
        }
        let next_retry = state.next_retry();

        assert_eq!(state.try_readmit(next_retry - 1), HealthTransition::Unchanged);
        assert!(!state.is_live());

        assert_eq!(state.try_readmit(next_retry), HealthTransition::Readmitted);
        assert!(state.is_live());
        assert_eq!(state.failure_count(), 0);
        assert_eq!(state.next_retry(), 0);

        assert_eq!(state.try_readmit(next_retry + 1), HealthTransition::Unchanged);
    }

    #[test]
    fn test_policy_from_pool_config() {
        let mut config = PoolConfig::new("alpha", "127.0.0.1:22121", vec![]);
        config.auto_eject_hosts = true;
        config.server_failure_limit = 5;
        config.server_retry_timeout_ms = 1_500;

        let policy = HealthPolicy::from(&config);
        assert!(policy.auto_eject);
        assert_eq!(policy.failure_limit, 5);
        assert_eq!(policy.retry_timeout, Duration::from_millis(1_500));
    }
}
