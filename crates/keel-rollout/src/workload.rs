//! The controller's narrow view of the cluster.
//!
//! The concrete orchestration API lives behind this trait. The controller
//! only ever creates, lists, and deletes replicas, swaps the template new
//! replicas are created from, and reads per-replica probe status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_core::{Artifact, BoxFuture, Digest};
use keel_health::{Probe, ProbeResult, ProbeTarget};

pub type ReplicaId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    /// Digest the replica was created from, when known.
    pub digest: Option<Digest>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("replica not found: {0}")]
    ReplicaNotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type WorkloadResult<T> = Result<T, WorkloadError>;

pub trait WorkloadHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Current replicas, oldest first.
    fn list_replicas(&self) -> BoxFuture<'_, WorkloadResult<Vec<Replica>>>;

    /// Point new replicas at `artifact`; returns the template it replaced.
    fn update_template<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, WorkloadResult<Option<Artifact>>>;

    /// Create `count` replicas from the current template.
    fn create_replicas(&self, count: u32) -> BoxFuture<'_, WorkloadResult<Vec<ReplicaId>>>;

    fn delete_replicas<'a>(&'a self, ids: &'a [ReplicaId]) -> BoxFuture<'a, WorkloadResult<()>>;

    /// Read one replica's probe status.
    fn probe<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ProbeResult>;
}

/// Adapts a workload's per-replica probes to the health gate.
///
/// An empty target replica list probes every current replica.
pub struct WorkloadProbe {
    workload: Arc<dyn WorkloadHandle>,
}

impl WorkloadProbe {
    pub fn new(workload: Arc<dyn WorkloadHandle>) -> Self {
        Self { workload }
    }
}

impl Probe for WorkloadProbe {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            let ids: Vec<ReplicaId> = if target.replicas.is_empty() {
                match self.workload.list_replicas().await {
                    Ok(replicas) => replicas.into_iter().map(|r| r.id).collect(),
                    Err(e) => {
                        tracing::debug!(workload = %target.workload, error = %e, "replica listing failed");
                        return ProbeResult::Failed;
                    }
                }
            } else {
                target.replicas.clone()
            };

            if ids.is_empty() {
                // Nothing running is trivially healthy (a scale to zero).
                return ProbeResult::Healthy;
            }

            let mut results = Vec::with_capacity(ids.len());
            for id in &ids {
                results.push(self.workload.probe(id).await);
            }
            ProbeResult::combine(results)
        })
    }
}

/// Pick `count` replicas to remove: those not running `keep` first,
/// oldest first within each group.
pub fn removal_candidates(replicas: &[Replica], keep: &Digest, count: usize) -> Vec<ReplicaId> {
    let (stale, current): (Vec<&Replica>, Vec<&Replica>) = replicas
        .iter()
        .partition(|r| r.digest.as_ref() != Some(keep));
    stale
        .into_iter()
        .chain(current)
        .take(count)
        .map(|r| r.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: &str, digest: &Digest) -> Replica {
        Replica {
            id: id.to_string(),
            digest: Some(digest.clone()),
        }
    }

    #[test]
    fn removal_prefers_stale_replicas() {
        let old = Digest::of_bytes(b"v1");
        let new = Digest::of_bytes(b"v2");
        let replicas = vec![
            replica("a", &new),
            replica("b", &old),
            replica("c", &new),
            replica("d", &old),
        ];
        assert_eq!(removal_candidates(&replicas, &new, 3), vec!["b", "d", "a"]);
        assert_eq!(removal_candidates(&replicas, &new, 10).len(), 4);
    }
}
