//! Rollout controller — drives one rollout through its state machine.
//!
//! ```text
//! Pending ──resolve+plan──▶ InProgress ──all steps + final gate──▶ Succeeded
//!                             │   ▲
//!                       pause │   │ resume (re-validates health)
//!                             ▼   │
//!                            Paused
//!
//! gate timeout ──auto_rollback──▶ replay steps in reverse ──▶ RolledBack
//!              └─otherwise──────▶ Failed
//! cancel (any non-terminal) ──best-effort rollback──▶ Failed
//! ```
//!
//! Cancellation is cooperative: it is observed at step boundaries, during
//! pause and retry waits, and at each health-poll tick. A cancel that lands
//! during the final confirmation still ends the rollout `Failed`.
//!
//! Plans move replica counts, not versions. The template is swapped to the
//! new artifact up front, so only replicas created by scale-up steps run it.
//! A same-count or scale-in rollout can succeed with no replica on the new
//! artifact; replacing existing replicas is the workload's concern.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_artifact::ArtifactResolver;
use keel_core::Artifact;
use keel_health::{HealthGate, HealthSample, ProbeTarget};

use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventKind, EventSink, RolloutState, RolloutStatus};
use crate::planner::{RolloutPlan, RolloutPlanner, Step};
use crate::strategy::RolloutRequest;
use crate::workload::{removal_candidates, ReplicaId, WorkloadHandle, WorkloadProbe};

/// A step that has been applied to the workload, with what it touched.
#[derive(Debug, Clone)]
struct AppliedStep {
    index: usize,
    step: Step,
    created: Vec<ReplicaId>,
    removed: u32,
}

impl AppliedStep {
    /// Gate on the replicas this step created, or the whole workload when
    /// it only removed replicas.
    fn gate_target(&self, workload: &str) -> ProbeTarget {
        if self.created.is_empty() {
            ProbeTarget::workload(workload)
        } else {
            ProbeTarget::replicas(workload, self.created.clone())
        }
    }
}

/// Executes a single rollout. Built and spawned by the registry.
pub struct RolloutController {
    request: RolloutRequest,
    workload: Arc<dyn WorkloadHandle>,
    resolver: Arc<ArtifactResolver>,
    gate: HealthGate,
    status: watch::Sender<RolloutStatus>,
    sink: EventSink,
    pause: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
    applied: Vec<AppliedStep>,
    /// Template in place before this rollout, once it has been swapped.
    previous_template: Option<Option<Artifact>>,
}

impl RolloutController {
    pub(crate) fn new(
        request: RolloutRequest,
        workload: Arc<dyn WorkloadHandle>,
        resolver: Arc<ArtifactResolver>,
        status: watch::Sender<RolloutStatus>,
        sink: EventSink,
        pause: watch::Receiver<bool>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let gate = HealthGate::new(
            Arc::new(WorkloadProbe::new(workload.clone())),
            request.policy.health.clone(),
        );
        Self {
            request,
            workload,
            resolver,
            gate,
            status,
            sink,
            pause,
            cancel,
            applied: Vec::new(),
            previous_template: None,
        }
    }

    /// Run to a terminal state and return the final snapshot.
    pub async fn run(mut self) -> RolloutStatus {
        info!(
            target = %self.request.target,
            revision = %self.request.revision,
            desired = self.request.desired_replicas,
            "rollout requested"
        );

        let result = self.execute().await;
        self.finish(result).await
    }

    async fn execute(&mut self) -> RolloutResult<()> {
        let artifact = self.resolve_artifact().await?;
        self.status
            .send_modify(|s| s.artifact = Some(artifact.clone()));
        self.sink.emit(EventKind::ArtifactResolved {
            artifact: artifact.clone(),
        });

        let current = self.workload.list_replicas().await?.len() as u32;
        self.status.send_modify(|s| {
            s.initial_replicas = Some(current);
            s.current_replicas = Some(current);
        });

        let policy = &self.request.policy;
        let plan = RolloutPlanner::plan(
            current,
            self.request.desired_replicas,
            policy.max_unavailable,
            policy.max_surge,
        )?;
        debug!(target = %self.request.target, steps = plan.len(), "plan computed");
        self.status.send_modify(|s| s.plan = Some(plan.clone()));
        self.sink.emit(EventKind::PlanComputed { plan: plan.clone() });

        self.check_cancel()?;
        self.transition(RolloutState::InProgress);

        let previous = self.workload.update_template(&artifact).await?;
        self.previous_template = Some(previous);

        self.run_steps(&plan, &artifact).await
    }

    /// Walk the step boundaries. Boundary `i` gates the replicas from step
    /// `i − 1` and then applies step `i`; the boundary after the last step
    /// is the final confirmation.
    async fn run_steps(&mut self, plan: &RolloutPlan, artifact: &Artifact) -> RolloutResult<()> {
        let name = self.workload.name().to_string();
        let mut resumed = false;

        for index in 0..=plan.steps.len() {
            self.check_cancel()?;
            if *self.pause.borrow() {
                self.wait_while_paused().await?;
                resumed = true;
            }

            let gate_target = match (resumed, self.applied.last()) {
                (true, _) => Some(ProbeTarget::workload(&name)),
                (false, Some(last)) => Some(last.gate_target(&name)),
                (false, None) if index == plan.steps.len() => Some(ProbeTarget::workload(&name)),
                (false, None) => None,
            };
            resumed = false;

            if let Some(target) = gate_target {
                self.await_gate(&target).await?;
            }

            if let Some(step) = plan.steps.get(index) {
                self.apply_step(index, *step, artifact).await?;
            }
        }

        // The final gate may have confirmed while a cancel was pending.
        self.check_cancel()
    }

    async fn resolve_artifact(&mut self) -> RolloutResult<Artifact> {
        let retry = self.request.policy.retry.clone();
        let mut attempt = 1;

        loop {
            self.check_cancel()?;
            match self.resolver.resolve(&self.request.revision).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay(attempt);
                    warn!(
                        target = %self.request.target,
                        attempt,
                        ?delay,
                        error = %e,
                        "artifact resolution failed, retrying"
                    );
                    self.sink.emit(EventKind::RetryScheduled {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    self.sleep_or_cancel(delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    error!(target = %self.request.target, attempt, error = %e, "artifact resolution failed");
                    return Err(e.into());
                }
            }
        }
    }

    async fn await_gate(&mut self, target: &ProbeTarget) -> RolloutResult<HealthSample> {
        let probe_target = target.to_string();
        let sink = &mut self.sink;
        let sample = self
            .gate
            .await_healthy_observed(
                target,
                self.request.policy.health_timeout,
                &self.cancel,
                |sample| {
                    sink.emit(EventKind::HealthSample {
                        probe_target: probe_target.clone(),
                        sample: *sample,
                    })
                },
            )
            .await?;
        Ok(sample)
    }

    async fn apply_step(&mut self, index: usize, step: Step, artifact: &Artifact) -> RolloutResult<()> {
        info!(target = %self.request.target, index, %step, "applying step");
        self.sink.emit(EventKind::StepStarted { index, step });

        let applied = if step.is_scale_up() {
            let created = self.workload.create_replicas(step.batch_size).await?;
            AppliedStep {
                index,
                step,
                created,
                removed: 0,
            }
        } else {
            let replicas = self.workload.list_replicas().await?;
            let victims =
                removal_candidates(&replicas, &artifact.digest, step.batch_size as usize);
            self.workload.delete_replicas(&victims).await?;
            AppliedStep {
                index,
                step,
                created: Vec::new(),
                removed: victims.len() as u32,
            }
        };

        self.sink.emit(EventKind::StepCompleted {
            index,
            step,
            replicas: applied.created.clone(),
        });
        self.applied.push(applied);
        self.status.send_modify(|s| {
            s.completed_steps = index + 1;
            s.current_replicas = Some(step.target_replica_count);
        });
        Ok(())
    }

    /// Undo applied steps newest-first and restore the previous template.
    /// The first failure aborts the rollback.
    async fn rollback(&mut self) -> RolloutResult<()> {
        if let Some(Some(previous)) = self.previous_template.take() {
            self.workload.update_template(&previous).await?;
        }
        while let Some(applied) = self.applied.pop() {
            self.undo_step(&applied).await?;
        }
        Ok(())
    }

    /// Like [`rollback`](Self::rollback), but failures are logged and the
    /// remaining steps are still undone.
    async fn rollback_best_effort(&mut self) {
        if let Some(Some(previous)) = self.previous_template.take() {
            if let Err(e) = self.workload.update_template(&previous).await {
                warn!(target = %self.request.target, error = %e, "template restore failed");
            }
        }
        while let Some(applied) = self.applied.pop() {
            if let Err(e) = self.undo_step(&applied).await {
                warn!(target = %self.request.target, index = applied.index, error = %e, "rollback step failed");
            }
        }
    }

    async fn undo_step(&mut self, applied: &AppliedStep) -> RolloutResult<()> {
        let undo = applied.step.reversed();
        info!(target = %self.request.target, index = applied.index, step = %undo, "rolling back step");
        self.sink.emit(EventKind::RollbackStep {
            index: applied.index,
            step: undo,
        });

        if applied.created.is_empty() {
            self.workload.create_replicas(applied.removed).await?;
        } else {
            self.workload.delete_replicas(&applied.created).await?;
        }
        self.status
            .send_modify(|s| s.current_replicas = Some(undo.target_replica_count));
        Ok(())
    }

    async fn finish(&mut self, result: RolloutResult<()>) -> RolloutStatus {
        let (state, error) = match result {
            Ok(()) => (RolloutState::Succeeded, None),
            Err(RolloutError::Cancelled) => {
                info!(target = %self.request.target, "rollout cancelled, rolling back applied steps");
                self.rollback_best_effort().await;
                (RolloutState::Failed, Some(RolloutError::Cancelled))
            }
            Err(e @ RolloutError::HealthTimeout { .. }) if self.request.policy.auto_rollback => {
                warn!(target = %self.request.target, error = %e, "health gate failed, rolling back");
                match self.rollback().await {
                    Ok(()) => (RolloutState::RolledBack, Some(e)),
                    Err(rollback_err) => {
                        error!(target = %self.request.target, error = %rollback_err, "rollback failed");
                        (RolloutState::Failed, Some(rollback_err))
                    }
                }
            }
            Err(e) => (RolloutState::Failed, Some(e)),
        };

        // Record what is actually running, not what was planned.
        let observed = match self.workload.list_replicas().await {
            Ok(replicas) => Some(replicas.len() as u32),
            Err(e) => {
                warn!(target = %self.request.target, error = %e, "could not read final replica count");
                self.status.borrow().current_replicas
            }
        };

        self.status.send_modify(|s| {
            s.current_replicas = observed;
            s.error = error.clone();
        });
        self.transition(state);
        self.sink.emit(EventKind::Finished {
            state,
            replicas: observed,
            error: error.as_ref().map(ToString::to_string),
        });

        match &error {
            None => info!(target = %self.request.target, replicas = ?observed, "rollout succeeded"),
            Some(e) => warn!(target = %self.request.target, ?state, replicas = ?observed, error = %e, "rollout ended"),
        }

        self.status.borrow().clone()
    }

    fn transition(&mut self, to: RolloutState) {
        let from = self.status.borrow().state;
        if from == to {
            return;
        }
        self.status.send_modify(|s| s.state = to);
        debug!(target = %self.request.target, ?from, ?to, "rollout state changed");
        self.sink.emit(EventKind::StateChanged { from, to });
    }

    fn check_cancel(&self) -> RolloutResult<()> {
        if *self.cancel.borrow() {
            Err(RolloutError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn wait_while_paused(&mut self) -> RolloutResult<()> {
        info!(target = %self.request.target, "rollout paused");
        self.transition(RolloutState::Paused);

        loop {
            self.check_cancel()?;
            if !*self.pause.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = self.pause.changed() => {
                    // Nobody left to resume us; carry on.
                    if changed.is_err() {
                        break;
                    }
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() && self.pause.changed().await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(target = %self.request.target, "rollout resumed");
        self.transition(RolloutState::InProgress);
        Ok(())
    }

    async fn sleep_or_cancel(&mut self, delay: std::time::Duration) -> RolloutResult<()> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return Ok(());
                    }
                    self.check_cancel()?;
                }
            }
        }
    }
}
