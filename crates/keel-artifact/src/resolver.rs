//! Revision to digest-pinned artifact resolution, cached per revision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use keel_core::{Artifact, BoxFuture, Digest, ImageReference, Revision};

use crate::error::{ArtifactError, ArtifactResult};

/// The build system's record of which image a revision produced.
pub trait BuildCatalog: Send + Sync {
    /// Returns `None` when no build exists for the revision.
    fn image_for<'a>(
        &'a self,
        revision: &'a str,
    ) -> BoxFuture<'a, ArtifactResult<Option<ImageReference>>>;
}

/// A container registry treated as an eventually-consistent tag → digest map.
pub trait Registry: Send + Sync {
    /// Returns `None` when the tag is unknown.
    fn digest_for<'a>(
        &'a self,
        reference: &'a ImageReference,
    ) -> BoxFuture<'a, ArtifactResult<Option<Digest>>>;
}

/// Resolves source revisions to immutable artifacts.
///
/// Cheap to share behind an `Arc`; every rollout controller in the process
/// resolves through the same instance so they share its cache.
pub struct ArtifactResolver {
    catalog: Arc<dyn BuildCatalog>,
    registry: Arc<dyn Registry>,
    /// revision → resolution slot. A slot is created on first request and
    /// filled by whichever caller wins the lookup.
    cache: RwLock<HashMap<Revision, Arc<OnceCell<Artifact>>>>,
    /// Registry lookups actually issued (cache misses that reached the registry).
    lookups: AtomicU64,
}

impl ArtifactResolver {
    pub fn new(catalog: Arc<dyn BuildCatalog>, registry: Arc<dyn Registry>) -> Self {
        Self {
            catalog,
            registry,
            cache: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
        }
    }

    /// Resolve a revision to its artifact.
    ///
    /// Fails with `NotFound` when no build (or tag) exists and with
    /// `RegistryUnavailable` on transient failures. Failures are not cached,
    /// and a revision that never resolved leaves no entry behind.
    pub async fn resolve(&self, revision: &str) -> ArtifactResult<Artifact> {
        let slot = self.slot(revision).await;

        if let Some(artifact) = slot.get() {
            debug!(%revision, digest = %artifact.digest.short(), "artifact cache hit");
            return Ok(artifact.clone());
        }

        match slot.get_or_try_init(|| self.lookup(revision)).await {
            Ok(artifact) => Ok(artifact.clone()),
            Err(e) => {
                self.evict_unresolved(revision, &slot).await;
                Err(e)
            }
        }
    }

    /// The cached artifact for a revision, if it has been resolved.
    pub async fn cached(&self, revision: &str) -> Option<Artifact> {
        let cache = self.cache.read().await;
        cache.get(revision).and_then(|slot| slot.get().cloned())
    }

    /// Number of registry lookups issued so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn slot(&self, revision: &str) -> Arc<OnceCell<Artifact>> {
        {
            let cache = self.cache.read().await;
            if let Some(slot) = cache.get(revision) {
                return slot.clone();
            }
        }
        let mut cache = self.cache.write().await;
        cache
            .entry(revision.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drop `slot` from the cache if it is still the entry for `revision`
    /// and nobody has filled it.
    async fn evict_unresolved(&self, revision: &str, slot: &Arc<OnceCell<Artifact>>) {
        let mut cache = self.cache.write().await;
        if cache
            .get(revision)
            .is_some_and(|entry| Arc::ptr_eq(entry, slot) && !entry.initialized())
        {
            cache.remove(revision);
        }
    }

    async fn lookup(&self, revision: &str) -> ArtifactResult<Artifact> {
        let reference = self
            .catalog
            .image_for(revision)
            .await?
            .ok_or_else(|| ArtifactError::NotFound(revision.to_string()))?;

        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                debug!(%revision, %reference, "querying registry");
                self.registry
                    .digest_for(&reference)
                    .await?
                    .ok_or_else(|| ArtifactError::NotFound(revision.to_string()))?
            }
        };

        info!(%revision, %reference, digest = %digest.short(), "artifact resolved");

        Ok(Artifact {
            source_revision: revision.to_string(),
            image_reference: reference,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{InMemoryRegistry, StaticCatalog};

    const REF: &str = "registry.example.com/web:abc123";

    fn setup() -> (Arc<InMemoryRegistry>, ArtifactResolver) {
        let catalog = StaticCatalog::new();
        catalog.insert("abc123", ImageReference::parse(REF).unwrap());

        let registry = Arc::new(InMemoryRegistry::new());
        registry.publish(REF, Digest::of_bytes(b"abc123-manifest"));

        let resolver = ArtifactResolver::new(Arc::new(catalog), registry.clone());
        (registry, resolver)
    }

    #[tokio::test]
    async fn resolves_tag_to_digest() {
        let (_, resolver) = setup();
        let artifact = resolver.resolve("abc123").await.unwrap();
        assert_eq!(artifact.source_revision, "abc123");
        assert_eq!(artifact.digest, Digest::of_bytes(b"abc123-manifest"));
        assert_eq!(artifact.image_reference.tag.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_cached() {
        let (registry, resolver) = setup();
        let first = resolver.resolve("abc123").await.unwrap();

        // Retagging in the registry must not change an already-resolved revision.
        registry.publish(REF, Digest::of_bytes(b"retagged"));

        let second = resolver.resolve("abc123").await.unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(resolver.lookups(), 1);
        assert_eq!(resolver.cached("abc123").await, Some(first));
    }

    #[tokio::test]
    async fn unknown_revision_is_not_found() {
        let (_, resolver) = setup();
        let err = resolver.resolve("deadbeef").await.unwrap_err();
        assert_eq!(err, ArtifactError::NotFound("deadbeef".to_string()));
        assert!(!err.is_retryable());
        assert_eq!(resolver.lookups(), 0);
    }

    #[tokio::test]
    async fn failed_revisions_leave_no_cache_entry() {
        let (registry, resolver) = setup();
        for revision in ["nope-1", "nope-2", "nope-3"] {
            assert!(resolver.resolve(revision).await.is_err());
        }
        assert_eq!(resolver.cache.read().await.len(), 0);

        registry.fail_next(1);
        assert!(resolver.resolve("abc123").await.is_err());
        assert_eq!(resolver.cache.read().await.len(), 0);

        resolver.resolve("abc123").await.unwrap();
        assert_eq!(resolver.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_not_found() {
        let catalog = StaticCatalog::new();
        catalog.insert("abc123", ImageReference::parse(REF).unwrap());
        let resolver =
            ArtifactResolver::new(Arc::new(catalog), Arc::new(InMemoryRegistry::new()));

        let err = resolver.resolve("abc123").await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn transient_failure_is_not_cached() {
        let (registry, resolver) = setup();
        registry.fail_next(1);

        let err = resolver.resolve("abc123").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(resolver.cached("abc123").await.is_none());

        let artifact = resolver.resolve("abc123").await.unwrap();
        assert_eq!(artifact.digest, Digest::of_bytes(b"abc123-manifest"));
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn pinned_reference_skips_registry() {
        let digest = Digest::of_bytes(b"pinned");
        let catalog = StaticCatalog::new();
        catalog.insert(
            "v2",
            ImageReference::parse(&format!("registry.example.com/web@{digest}")).unwrap(),
        );
        let registry = Arc::new(InMemoryRegistry::new());
        let resolver = ArtifactResolver::new(Arc::new(catalog), registry.clone());

        let artifact = resolver.resolve("v2").await.unwrap();
        assert_eq!(artifact.digest, digest);
        assert_eq!(resolver.lookups(), 0);
        assert_eq!(registry.lookups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolutions_share_one_lookup() {
        let (registry, resolver) = setup();
        registry.set_latency(Duration::from_millis(200));
        let resolver = Arc::new(resolver);

        let a = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("abc123").await }
        });
        let b = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("abc123").await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.lookups(), 1);
        assert_eq!(resolver.lookups(), 1);
    }
}
