//! Rollout state, status snapshots, and the structured event stream.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use keel_core::Artifact;
use keel_health::HealthSample;

use crate::error::RolloutError;
use crate::planner::{RolloutPlan, Step};

/// Lifecycle of a rollout. Only the controller mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    InProgress,
    Paused,
    Succeeded,
    Failed,
    RolledBack,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutState::Succeeded | RolloutState::Failed | RolloutState::RolledBack
        )
    }
}

/// Point-in-time view of a rollout.
///
/// Terminal snapshots always carry the replica count actually observed
/// on the workload once the controller stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub rollout_id: String,
    pub target: String,
    pub revision: String,
    pub state: RolloutState,
    pub artifact: Option<Artifact>,
    pub plan: Option<RolloutPlan>,
    /// Forward steps applied. Rollback does not decrement this.
    pub completed_steps: usize,
    pub initial_replicas: Option<u32>,
    pub current_replicas: Option<u32>,
    pub error: Option<RolloutError>,
}

impl RolloutStatus {
    pub(crate) fn new(rollout_id: &str, target: &str, revision: &str) -> Self {
        Self {
            rollout_id: rollout_id.to_string(),
            target: target.to_string(),
            revision: revision.to_string(),
            state: RolloutState::Pending,
            artifact: None,
            plan: None,
            completed_steps: 0,
            initial_replicas: None,
            current_replicas: None,
            error: None,
        }
    }

    /// The last forward step applied, if any.
    pub fn last_completed_step(&self) -> Option<&Step> {
        let plan = self.plan.as_ref()?;
        self.completed_steps
            .checked_sub(1)
            .and_then(|i| plan.steps.get(i))
    }
}

/// One entry in a rollout's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub rollout_id: String,
    pub target: String,
    /// Monotonic per rollout, starting at 1.
    pub seq: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: RolloutState,
        to: RolloutState,
    },
    ArtifactResolved {
        artifact: Artifact,
    },
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    PlanComputed {
        plan: RolloutPlan,
    },
    StepStarted {
        index: usize,
        step: Step,
    },
    StepCompleted {
        index: usize,
        step: Step,
        replicas: Vec<String>,
    },
    HealthSample {
        probe_target: String,
        sample: HealthSample,
    },
    RollbackStep {
        index: usize,
        step: Step,
    },
    Finished {
        state: RolloutState,
        replicas: Option<u32>,
        error: Option<String>,
    },
}

/// Numbers and publishes events. Sending with no subscribers is fine.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    rollout_id: String,
    target: String,
    seq: u64,
    tx: broadcast::Sender<RolloutEvent>,
}

impl EventSink {
    pub(crate) fn new(rollout_id: &str, target: &str, tx: broadcast::Sender<RolloutEvent>) -> Self {
        Self {
            rollout_id: rollout_id.to_string(),
            target: target.to_string(),
            seq: 0,
            tx,
        }
    }

    pub(crate) fn emit(&mut self, kind: EventKind) {
        self.seq += 1;
        let _ = self.tx.send(RolloutEvent {
            rollout_id: self.rollout_id.clone(),
            target: self.target.clone(),
            seq: self.seq,
            timestamp_ms: epoch_millis(),
            kind,
        });
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
