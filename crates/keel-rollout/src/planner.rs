//! Replica-count transitions within a surge budget.
//!
//! A plan moves a workload from `current` to `desired` replicas in steps.
//! Scale-ups add at most `max_surge` replicas per step (or `max_unavailable`
//! when no surge is allowed, since the fresh replicas are not yet serving).
//! Scale-downs remove at most `max_unavailable` per step (or `max_surge`
//! when none may be unavailable, since only surplus replicas are removed).
//!
//! Availability never drops below `min(current, desired) − max_unavailable`:
//! a scale-up never removes anything, and a scale-down stops at `desired`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

/// One transition in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Replica count once the step is applied.
    pub target_replica_count: u32,
    /// Replica count before the step.
    pub old_replica_count: u32,
    /// Replicas created (scale-up) or removed (scale-down) by the step.
    pub batch_size: u32,
}

impl Step {
    pub fn delta(&self) -> i64 {
        i64::from(self.target_replica_count) - i64::from(self.old_replica_count)
    }

    pub fn is_scale_up(&self) -> bool {
        self.target_replica_count > self.old_replica_count
    }

    /// Replicas guaranteed to be serving while the step is in flight.
    pub fn min_available(&self) -> u32 {
        self.old_replica_count.min(self.target_replica_count)
    }

    /// The step that undoes this one.
    pub fn reversed(&self) -> Step {
        Step {
            target_replica_count: self.old_replica_count,
            old_replica_count: self.target_replica_count,
            batch_size: self.batch_size,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:+} ({} → {})",
            self.delta(),
            self.old_replica_count,
            self.target_replica_count
        )
    }
}

/// Ordered steps from `current_replicas` to `desired_replicas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub max_unavailable: u32,
    pub max_surge: u32,
    pub steps: Vec<Step>,
}

impl RolloutPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn total_delta(&self) -> i64 {
        self.steps.iter().map(Step::delta).sum()
    }

    /// Lowest number of serving replicas the plan may ever leave.
    pub fn availability_floor(&self) -> u32 {
        self.current_replicas
            .min(self.desired_replicas)
            .saturating_sub(self.max_unavailable)
    }

    /// Whether every step stays at or above the availability floor.
    pub fn respects_floor(&self) -> bool {
        let floor = self.availability_floor();
        self.steps.iter().all(|s| s.min_available() >= floor)
    }
}

pub struct RolloutPlanner;

impl RolloutPlanner {
    /// Compute the step sequence for a transition.
    ///
    /// Deterministic: identical inputs yield identical plans. Equal counts
    /// give an empty plan; a zero surge and zero unavailability budget is
    /// `InfeasiblePlan`.
    pub fn plan(
        current_replicas: u32,
        desired_replicas: u32,
        max_unavailable: u32,
        max_surge: u32,
    ) -> RolloutResult<RolloutPlan> {
        let mut plan = RolloutPlan {
            current_replicas,
            desired_replicas,
            max_unavailable,
            max_surge,
            steps: Vec::new(),
        };

        if current_replicas == desired_replicas {
            return Ok(plan);
        }
        if max_unavailable == 0 && max_surge == 0 {
            return Err(RolloutError::InfeasiblePlan {
                max_unavailable,
                max_surge,
            });
        }

        let scale_up = desired_replicas > current_replicas;
        let budget = match (scale_up, max_surge, max_unavailable) {
            (true, 0, mu) => mu,
            (true, ms, _) => ms,
            (false, ms, 0) => ms,
            (false, _, mu) => mu,
        };

        let mut count = current_replicas;
        while count != desired_replicas {
            let remaining = count.abs_diff(desired_replicas);
            let batch = budget.min(remaining);
            let next = if scale_up { count + batch } else { count - batch };
            plan.steps.push(Step {
                target_replica_count: next,
                old_replica_count: count,
                batch_size: batch,
            });
            count = next;
        }

        Ok(plan)
    }
}
