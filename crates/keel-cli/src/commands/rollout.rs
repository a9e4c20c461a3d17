use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use keel_artifact::{ArtifactResolver, InMemoryRegistry, StaticCatalog};
use keel_core::{Digest, ImageReference, KeelConfig};
use keel_health::HealthGateConfig;
use keel_rollout::{
    EventKind, RetryPolicy, RolloutPolicy, RolloutRegistry, RolloutRequest, RolloutState,
    SimulatedWorkload,
};

pub async fn rollout(config_path: &str, revision: &str, desired: Option<u32>) -> anyhow::Result<()> {
    let config = KeelConfig::from_file(Path::new(config_path))
        .with_context(|| format!("failed to load {config_path}"))?;

    let request = request_from_config(&config, revision, desired)?;
    let resolver = resolver_from_config(&config)?;
    let workload = workload_from_config(&config);

    let rollouts = RolloutRegistry::new(Arc::new(resolver));
    let handle = rollouts.start(request, workload).await?;
    let mut events = handle.subscribe();
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event.kind, EventKind::Finished { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!(rollout = %handle.id(), "interrupt received, cancelling rollout");
                handle.cancel();
                interrupted = true;
            }
        }
    }

    let status = handle.wait().await;
    if status.state != RolloutState::Succeeded {
        match &status.error {
            Some(e) => anyhow::bail!("rollout {} ended {:?}: {e}", status.rollout_id, status.state),
            None => anyhow::bail!("rollout {} ended {:?}", status.rollout_id, status.state),
        }
    }
    Ok(())
}

/// Build the request from `[target]`, `[rollout]`, `[health]` and `[retry]`.
pub fn request_from_config(
    config: &KeelConfig,
    revision: &str,
    desired: Option<u32>,
) -> anyhow::Result<RolloutRequest> {
    let rollout = config.rollout();
    let health = config.health();
    let retry = config.retry();
    let defaults = RolloutPolicy::default();

    let desired_replicas = desired
        .or(rollout.desired_replicas)
        .context("no desired replica count: set [rollout].desired_replicas or pass --desired")?;

    Ok(RolloutRequest {
        target: config.target.name.clone(),
        revision: revision.to_string(),
        desired_replicas,
        policy: RolloutPolicy {
            max_unavailable: rollout.max_unavailable.unwrap_or(defaults.max_unavailable),
            max_surge: rollout.max_surge.unwrap_or(defaults.max_surge),
            auto_rollback: rollout.auto_rollback.unwrap_or(defaults.auto_rollback),
            health_timeout: health.timeout()?,
            health: HealthGateConfig {
                interval: health.interval()?,
                healthy_threshold: health.healthy_threshold(),
            },
            retry: RetryPolicy {
                base: retry.base()?,
                cap: retry.cap()?,
                max_attempts: retry.max_attempts(),
            },
        },
    })
}

/// Seed the build catalog from `[builds]` and the registry from `[registry]`.
pub fn resolver_from_config(config: &KeelConfig) -> anyhow::Result<ArtifactResolver> {
    let catalog = StaticCatalog::new();
    for (revision, reference) in config.builds.iter().flatten() {
        let reference = ImageReference::parse(reference)
            .with_context(|| format!("[builds].{revision}"))?;
        catalog.insert(revision, reference);
    }

    let registry = InMemoryRegistry::new();
    for (reference, digest) in config.registry.iter().flatten() {
        let parsed = ImageReference::parse(reference)
            .with_context(|| format!("[registry] key {reference:?}"))?;
        let digest = Digest::parse(digest).with_context(|| format!("[registry].{reference:?}"))?;
        registry.publish(&parsed.to_string(), digest);
    }

    Ok(ArtifactResolver::new(Arc::new(catalog), Arc::new(registry)))
}

pub fn workload_from_config(config: &KeelConfig) -> Arc<SimulatedWorkload> {
    let simulation = config.simulation();
    let workload = SimulatedWorkload::new(
        &config.target.name,
        simulation.initial_replicas.unwrap_or(1),
        None,
    );
    for ordinal in simulation.unhealthy_replicas.iter().flatten() {
        workload.mark_unhealthy(*ordinal);
    }
    Arc::new(workload)
}
