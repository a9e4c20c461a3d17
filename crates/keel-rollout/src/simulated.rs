//! In-memory workload used by `keel rollout` and tests.
//!
//! Replicas are numbered by creation order (ordinals), starting at 0 for
//! the initial replicas. Individual ordinals can be marked unhealthy so a
//! scenario can fail a specific step's gate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use keel_core::{Artifact, BoxFuture};
use keel_health::ProbeResult;

use crate::workload::{Replica, ReplicaId, WorkloadError, WorkloadHandle, WorkloadResult};

#[derive(Debug)]
struct SimReplica {
    id: ReplicaId,
    ordinal: u32,
    artifact: Option<Artifact>,
}

#[derive(Debug, Default)]
struct SimState {
    replicas: Vec<SimReplica>,
    template: Option<Artifact>,
    next_ordinal: u32,
    unhealthy: HashSet<u32>,
    fail_creates: bool,
}

pub struct SimulatedWorkload {
    name: String,
    state: Mutex<SimState>,
    probe_latency: Duration,
    probes: AtomicU64,
}

impl SimulatedWorkload {
    /// A workload running `initial_replicas` replicas of `template`.
    pub fn new(name: &str, initial_replicas: u32, template: Option<Artifact>) -> Self {
        let workload = Self {
            name: name.to_string(),
            state: Mutex::new(SimState {
                template,
                ..Default::default()
            }),
            probe_latency: Duration::ZERO,
            probes: AtomicU64::new(0),
        };
        {
            let mut state = workload.locked();
            for _ in 0..initial_replicas {
                spawn_replica(&workload.name, &mut state);
            }
        }
        workload
    }

    /// Each probe takes `latency` to answer.
    pub fn with_probe_latency(mut self, latency: Duration) -> Self {
        self.probe_latency = latency;
        self
    }

    pub fn mark_unhealthy(&self, ordinal: u32) {
        self.locked().unhealthy.insert(ordinal);
    }

    pub fn mark_healthy(&self, ordinal: u32) {
        self.locked().unhealthy.remove(&ordinal);
    }

    /// Make replica creation fail until reset.
    pub fn fail_creates(&self, fail: bool) {
        self.locked().fail_creates = fail;
    }

    pub fn replica_count(&self) -> u32 {
        self.locked().replicas.len() as u32
    }

    pub fn template(&self) -> Option<Artifact> {
        self.locked().template.clone()
    }

    /// Replicas created from `artifact`'s digest.
    pub fn replicas_running(&self, artifact: &Artifact) -> u32 {
        self.locked()
            .replicas
            .iter()
            .filter(|r| r.artifact.as_ref().map(|a| &a.digest) == Some(&artifact.digest))
            .count() as u32
    }

    /// Probes answered so far.
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    fn locked(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_replica(name: &str, state: &mut SimState) -> ReplicaId {
    let ordinal = state.next_ordinal;
    state.next_ordinal += 1;
    let id = format!("{name}-{ordinal}");
    state.replicas.push(SimReplica {
        id: id.clone(),
        ordinal,
        artifact: state.template.clone(),
    });
    id
}

impl WorkloadHandle for SimulatedWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_replicas(&self) -> BoxFuture<'_, WorkloadResult<Vec<Replica>>> {
        Box::pin(async move {
            Ok(self
                .locked()
                .replicas
                .iter()
                .map(|r| Replica {
                    id: r.id.clone(),
                    digest: r.artifact.as_ref().map(|a| a.digest.clone()),
                })
                .collect())
        })
    }

    fn update_template<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, WorkloadResult<Option<Artifact>>> {
        Box::pin(async move {
            let previous = self.locked().template.replace(artifact.clone());
            debug!(workload = %self.name, digest = %artifact.digest.short(), "template updated");
            Ok(previous)
        })
    }

    fn create_replicas(&self, count: u32) -> BoxFuture<'_, WorkloadResult<Vec<ReplicaId>>> {
        Box::pin(async move {
            let mut state = self.locked();
            if state.fail_creates {
                return Err(WorkloadError::Unavailable(format!(
                    "{}: create rejected",
                    self.name
                )));
            }
            let ids = (0..count)
                .map(|_| spawn_replica(&self.name, &mut state))
                .collect::<Vec<_>>();
            debug!(workload = %self.name, created = ?ids, "replicas created");
            Ok(ids)
        })
    }

    fn delete_replicas<'a>(&'a self, ids: &'a [ReplicaId]) -> BoxFuture<'a, WorkloadResult<()>> {
        Box::pin(async move {
            let mut state = self.locked();
            if let Some(missing) = ids
                .iter()
                .find(|id| !state.replicas.iter().any(|r| &r.id == *id))
            {
                return Err(WorkloadError::ReplicaNotFound(missing.clone()));
            }
            state.replicas.retain(|r| !ids.contains(&r.id));
            debug!(workload = %self.name, deleted = ?ids, "replicas deleted");
            Ok(())
        })
    }

    fn probe<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            if !self.probe_latency.is_zero() {
                tokio::time::sleep(self.probe_latency).await;
            }
            self.probes.fetch_add(1, Ordering::SeqCst);
            let state = self.locked();
            match state.replicas.iter().find(|r| r.id == id) {
                Some(r) if state.unhealthy.contains(&r.ordinal) => ProbeResult::Unhealthy,
                Some(_) => ProbeResult::Healthy,
                None => ProbeResult::Failed,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Digest, ImageReference};

    fn artifact(tag: &str) -> Artifact {
        Artifact {
            source_revision: tag.to_string(),
            image_reference: ImageReference::parse(&format!("registry.example.com/web:{tag}"))
                .unwrap(),
            digest: Digest::of_bytes(tag.as_bytes()),
        }
    }

    #[tokio::test]
    async fn create_and_delete() {
        let w = SimulatedWorkload::new("web", 2, Some(artifact("v1")));
        w.update_template(&artifact("v2")).await.unwrap();

        let created = w.create_replicas(2).await.unwrap();
        assert_eq!(created, vec!["web-2", "web-3"]);
        assert_eq!(w.replica_count(), 4);
        assert_eq!(w.replicas_running(&artifact("v2")), 2);

        w.delete_replicas(&created).await.unwrap();
        assert_eq!(w.replica_count(), 2);
        assert_eq!(w.replicas_running(&artifact("v1")), 2);
    }

    #[tokio::test]
    async fn delete_unknown_replica_fails() {
        let w = SimulatedWorkload::new("web", 1, None);
        let err = w.delete_replicas(&["web-9".to_string()]).await.unwrap_err();
        assert_eq!(err, WorkloadError::ReplicaNotFound("web-9".into()));
        assert_eq!(w.replica_count(), 1);
    }

    #[tokio::test]
    async fn probe_reflects_marks() {
        let w = SimulatedWorkload::new("web", 2, None);
        w.mark_unhealthy(1);
        assert_eq!(w.probe("web-0").await, ProbeResult::Healthy);
        assert_eq!(w.probe("web-1").await, ProbeResult::Unhealthy);
        assert_eq!(w.probe("web-7").await, ProbeResult::Failed);
        w.mark_healthy(1);
        assert_eq!(w.probe("web-1").await, ProbeResult::Healthy);
        assert_eq!(w.probes(), 4);
    }

    #[tokio::test]
    async fn update_template_returns_previous() {
        let w = SimulatedWorkload::new("web", 0, Some(artifact("v1")));
        let prev = w.update_template(&artifact("v2")).await.unwrap();
        assert_eq!(prev, Some(artifact("v1")));
        assert_eq!(w.template(), Some(artifact("v2")));
    }
}
