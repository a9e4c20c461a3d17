//! In-process build catalog and registry.
//!
//! Used by `keel rollout` when builds and tags are declared in keel.toml,
//! and by tests. The registry can inject latency and transient failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use keel_core::{BoxFuture, Digest, ImageReference};

use crate::error::{ArtifactError, ArtifactResult};
use crate::resolver::{BuildCatalog, Registry};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fixed revision → image map.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    builds: Mutex<HashMap<String, ImageReference>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, revision: &str, reference: ImageReference) {
        locked(&self.builds).insert(revision.to_string(), reference);
    }
}

impl BuildCatalog for StaticCatalog {
    fn image_for<'a>(
        &'a self,
        revision: &'a str,
    ) -> BoxFuture<'a, ArtifactResult<Option<ImageReference>>> {
        Box::pin(async move { Ok(locked(&self.builds).get(revision).cloned()) })
    }
}

/// Tag → digest map keyed by the unpinned reference string.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    tags: Mutex<HashMap<String, Digest>>,
    latency: Mutex<Duration>,
    failures_remaining: AtomicU32,
    lookups: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `reference` (e.g. `registry.example.com/web:v1`) at `digest`.
    pub fn publish(&self, reference: &str, digest: Digest) {
        locked(&self.tags).insert(reference.to_string(), digest);
    }

    /// Delay every lookup by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.latency) = latency;
    }

    /// Make the next `n` lookups fail with `RegistryUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Lookups received, including failed ones.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Registry for InMemoryRegistry {
    fn digest_for<'a>(
        &'a self,
        reference: &'a ImageReference,
    ) -> BoxFuture<'a, ArtifactResult<Option<Digest>>> {
        Box::pin(async move {
            self.lookups.fetch_add(1, Ordering::SeqCst);

            let latency = *locked(&self.latency);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let failing = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                debug!(%reference, "injected registry failure");
                return Err(ArtifactError::RegistryUnavailable(format!(
                    "{}: service unavailable",
                    reference.registry
                )));
            }

            Ok(locked(&self.tags).get(&reference.to_string()).cloned())
        })
    }
}
