//! keel.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    pub target: TargetConfig,
    pub rollout: Option<RolloutConfig>,
    pub health: Option<HealthConfig>,
    pub retry: Option<RetryConfig>,
    /// Source revision → mutable image reference, as published by the build.
    pub builds: Option<BTreeMap<String, String>>,
    /// Image reference → digest, for the in-process registry.
    pub registry: Option<BTreeMap<String, String>>,
    pub simulation: Option<SimulationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub desired_replicas: Option<u32>,
    pub max_unavailable: Option<u32>,
    pub max_surge: Option<u32>,
    pub auto_rollback: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base: Option<String>,
    pub cap: Option<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub initial_replicas: Option<u32>,
    /// Replica ordinals (creation order, starting at 0) that never pass probes.
    pub unhealthy_replicas: Option<Vec<u32>>,
}

impl HealthConfig {
    pub fn interval(&self) -> anyhow::Result<Duration> {
        duration_or(&self.interval, DEFAULT_HEALTH_INTERVAL, "health.interval")
    }

    pub fn timeout(&self) -> anyhow::Result<Duration> {
        duration_or(&self.timeout, DEFAULT_HEALTH_TIMEOUT, "health.timeout")
    }

    pub fn healthy_threshold(&self) -> u32 {
        self.healthy_threshold.unwrap_or(DEFAULT_HEALTHY_THRESHOLD)
    }
}

impl RetryConfig {
    pub fn base(&self) -> anyhow::Result<Duration> {
        duration_or(&self.base, DEFAULT_RETRY_BASE, "retry.base")
    }

    pub fn cap(&self) -> anyhow::Result<Duration> {
        duration_or(&self.cap, DEFAULT_RETRY_CAP, "retry.cap")
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS)
    }
}

fn duration_or(value: &Option<String>, default: Duration, key: &str) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) => parse_duration(s)
            .ok_or_else(|| anyhow::anyhow!("invalid duration for {key}: {s:?}")),
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn rollout(&self) -> RolloutConfig {
        self.rollout.clone().unwrap_or_default()
    }

    pub fn health(&self) -> HealthConfig {
        self.health.clone().unwrap_or_default()
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    pub fn simulation(&self) -> SimulationConfig {
        self.simulation.clone().unwrap_or_default()
    }

    /// Scaffold a starter keel.toml for a target.
    pub fn scaffold(name: &str, image: &str) -> Self {
        let revision = "0000000".to_string();
        let reference = format!("{image}:{revision}");
        KeelConfig {
            target: TargetConfig {
                name: name.to_string(),
            },
            rollout: Some(RolloutConfig {
                desired_replicas: Some(3),
                max_unavailable: Some(0),
                max_surge: Some(1),
                auto_rollback: Some(true),
            }),
            health: Some(HealthConfig {
                interval: Some("1s".to_string()),
                timeout: Some("30s".to_string()),
                healthy_threshold: Some(DEFAULT_HEALTHY_THRESHOLD),
            }),
            retry: Some(RetryConfig {
                base: Some("2s".to_string()),
                cap: Some("60s".to_string()),
                max_attempts: Some(DEFAULT_RETRY_ATTEMPTS),
            }),
            builds: Some(BTreeMap::from([(revision, reference.clone())])),
            registry: Some(BTreeMap::from([(
                reference.clone(),
                crate::Digest::of_bytes(reference.as_bytes()).to_string(),
            )])),
            simulation: Some(SimulationConfig {
                initial_replicas: Some(1),
                unhealthy_replicas: None,
            }),
        }
    }
}
