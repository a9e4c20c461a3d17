//! Rollout policy: surge and unavailability budget, health gating, retries.

use std::time::Duration;

use keel_health::HealthGateConfig;

/// How a rollout may move a workload between replica counts.
#[derive(Debug, Clone)]
pub struct RolloutPolicy {
    /// Replicas that may be out of service at once.
    pub max_unavailable: u32,
    /// Replicas that may be added in a single step.
    pub max_surge: u32,
    /// Undo applied steps when a health gate times out.
    pub auto_rollback: bool,
    /// How long each health gate may wait for confirmation.
    pub health_timeout: Duration,
    pub health: HealthGateConfig,
    pub retry: RetryPolicy,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            max_unavailable: 0,
            max_surge: 1,
            auto_rollback: true,
            health_timeout: Duration::from_secs(30),
            health: HealthGateConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for transient registry failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base·2^(attempt−1), capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

/// A request to move `target` to `revision` at `desired_replicas`.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub target: String,
    pub revision: String,
    pub desired_replicas: u32,
    pub policy: RolloutPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let p = RolloutPolicy::default();
        assert_eq!(p.max_surge, 1);
        assert_eq!(p.max_unavailable, 0);
        assert!(p.auto_rollback);
        assert_eq!(p.health.healthy_threshold, 3);
        assert_eq!(p.health.interval, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let r = RetryPolicy::default();
        assert_eq!(r.delay(1), Duration::from_secs(2));
        assert_eq!(r.delay(2), Duration::from_secs(4));
        assert_eq!(r.delay(3), Duration::from_secs(8));
        assert_eq!(r.delay(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_caps() {
        let r = RetryPolicy::default();
        assert_eq!(r.delay(6), Duration::from_secs(60));
        assert_eq!(r.delay(40), Duration::from_secs(60));
    }
}
