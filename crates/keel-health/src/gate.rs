//! Poll a target until it is confirmed healthy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_core::BoxFuture;

use crate::checker::{HealthSample, HealthStatus, ProbeResult, StreakTracker};
use crate::error::{HealthError, HealthResult};

/// Something that can report the health of a target.
pub trait Probe: Send + Sync {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult>;
}

/// What the gate is waiting on: a workload, optionally narrowed to
/// specific replicas. An empty replica list means the whole workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub workload: String,
    pub replicas: Vec<String>,
}

impl ProbeTarget {
    pub fn workload(workload: &str) -> Self {
        Self {
            workload: workload.to_string(),
            replicas: Vec::new(),
        }
    }

    pub fn replicas(workload: &str, replicas: Vec<String>) -> Self {
        Self {
            workload: workload.to_string(),
            replicas,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.replicas.is_empty() {
            write!(f, "{}", self.workload)
        } else {
            write!(f, "{}[{}]", self.workload, self.replicas.join(","))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthGateConfig {
    /// Delay between probes.
    pub interval: Duration,
    /// Consecutive healthy samples needed to confirm.
    pub healthy_threshold: u32,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            healthy_threshold: 3,
        }
    }
}

/// Polls a probe until the target is confirmed healthy.
#[derive(Clone)]
pub struct HealthGate {
    probe: Arc<dyn Probe>,
    config: HealthGateConfig,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn Probe>, config: HealthGateConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &HealthGateConfig {
        &self.config
    }

    /// Wait until `target` is confirmed healthy.
    ///
    /// Returns the confirming sample, `HealthTimeout` once `timeout` has
    /// elapsed without confirmation, or `Cancelled` when `cancel` flips to
    /// true. Cancellation is checked between probes; a probe in flight
    /// always runs to completion.
    pub async fn await_healthy(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        cancel: &watch::Receiver<bool>,
    ) -> HealthResult<HealthSample> {
        self.await_healthy_observed(target, timeout, cancel, |_| {}).await
    }

    /// Like [`await_healthy`](Self::await_healthy), reporting every sample
    /// to `on_sample` as it is taken.
    pub async fn await_healthy_observed<F>(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        cancel: &watch::Receiver<bool>,
        mut on_sample: F,
    ) -> HealthResult<HealthSample>
    where
        F: FnMut(&HealthSample) + Send,
    {
        let mut cancel = cancel.clone();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut tracker = StreakTracker::new(self.config.healthy_threshold);

        debug!(%target, ?timeout, "health gate polling");

        loop {
            if *cancel.borrow_and_update() {
                info!(%target, streak = tracker.streak(), "health gate cancelled");
                return Err(HealthError::Cancelled);
            }

            let result = self.probe.check(target).await;
            let sample = HealthSample::now(HealthStatus::from(result));
            on_sample(&sample);

            if tracker.record(sample.status) {
                info!(%target, elapsed = ?started.elapsed(), "health gate confirmed");
                return Ok(sample);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%target, streak = tracker.streak(), "health gate timed out");
                return Err(HealthError::HealthTimeout {
                    target: target.to_string(),
                    elapsed: now - started,
                    streak: tracker.streak(),
                });
            }

            let wait = self.config.interval.min(deadline - now);
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => {}
                changed = cancel.changed() => {
                    // A dropped sender can never cancel; finish the tick.
                    if changed.is_err() {
                        (&mut sleep).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replays a script of results, then repeats the last one.
    struct ScriptedProbe {
        script: Mutex<VecDeque<ProbeResult>>,
        last: Mutex<ProbeResult>,
        latency: Duration,
        started: AtomicU32,
        completed: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(script: &[ProbeResult]) -> Arc<Self> {
            Self::with_latency(script, Duration::ZERO)
        }

        fn with_latency(script: &[ProbeResult], latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(ProbeResult::Failed),
                latency,
                started: AtomicU32::new(0),
                completed: AtomicU32::new(0),
            })
        }
    }

    impl Probe for ScriptedProbe {
        fn check<'a>(&'a self, _target: &'a ProbeTarget) -> BoxFuture<'a, ProbeResult> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let next = self.script.lock().unwrap().pop_front();
                let result = match next {
                    Some(r) => {
                        *self.last.lock().unwrap() = r;
                        r
                    }
                    None => *self.last.lock().unwrap(),
                };
                self.completed.fetch_add(1, Ordering::SeqCst);
                result
            })
        }
    }

    fn gate(probe: Arc<ScriptedProbe>) -> HealthGate {
        HealthGate::new(probe, HealthGateConfig::default())
    }

    use ProbeResult::{Failed, Healthy, Unhealthy};

    #[tokio::test(start_paused = true)]
    async fn confirms_after_three_consecutive() {
        let probe = ScriptedProbe::new(&[Healthy, Healthy, Healthy]);
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();

        let sample = gate(probe.clone())
            .await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(30), &rx)
            .await
            .unwrap();

        assert_eq!(sample.status, HealthStatus::Healthy);
        assert_eq!(probe.completed.load(Ordering::SeqCst), 3);
        // Two intervals between three probes.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_resets_streak() {
        let probe =
            ScriptedProbe::new(&[Healthy, Healthy, Unhealthy, Healthy, Healthy, Healthy]);
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();

        gate(probe.clone())
            .await_healthy_observed(
                &ProbeTarget::workload("web"),
                Duration::from_secs(30),
                &rx,
                |s| seen.push(s.status),
            )
            .await
            .unwrap();

        assert_eq!(seen.len(), 6);
        assert_eq!(seen[2], HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_samples_do_not_reset() {
        let probe = ScriptedProbe::new(&[Healthy, Failed, Healthy, Failed, Healthy]);
        let (_tx, rx) = watch::channel(false);

        gate(probe.clone())
            .await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(30), &rx)
            .await
            .unwrap();
        assert_eq!(probe.completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_healthy() {
        let probe = ScriptedProbe::new(&[Unhealthy]);
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();

        let err = gate(probe)
            .await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(5), &rx)
            .await
            .unwrap_err();

        match err {
            HealthError::HealthTimeout { target, streak, .. } => {
                assert_eq!(target, "web");
                assert_eq!(streak, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_probe() {
        let probe = ScriptedProbe::new(&[Healthy]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = gate(probe.clone())
            .await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(5), &rx)
            .await
            .unwrap_err();
        assert_eq!(err, HealthError::Cancelled);
        assert_eq!(probe.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_probe_waits_for_probe_to_finish() {
        let probe = ScriptedProbe::with_latency(&[Healthy], Duration::from_millis(500));
        let (tx, rx) = watch::channel(false);
        let g = gate(probe.clone());

        let task = tokio::spawn(async move {
            g.await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(30), &rx)
                .await
        });

        // Cancel while the first probe is in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);
        assert_eq!(probe.completed.load(Ordering::SeqCst), 0);
        tx.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, HealthError::Cancelled);
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);
        assert_eq!(probe.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_interval_is_prompt() {
        let probe = ScriptedProbe::new(&[Unhealthy]);
        let (tx, rx) = watch::channel(false);
        let g = HealthGate::new(
            probe.clone(),
            HealthGateConfig {
                interval: Duration::from_secs(10),
                healthy_threshold: 3,
            },
        );

        let started = Instant::now();
        let task = tokio::spawn(async move {
            g.await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(60), &rx)
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap().unwrap_err(), HealthError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(probe.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_cancel_sender_does_not_spin() {
        let probe = ScriptedProbe::new(&[Healthy]);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        gate(probe.clone())
            .await_healthy(&ProbeTarget::workload("web"), Duration::from_secs(30), &rx)
            .await
            .unwrap();
        assert_eq!(probe.completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn target_display() {
        assert_eq!(ProbeTarget::workload("web").to_string(), "web");
        assert_eq!(
            ProbeTarget::replicas("web", vec!["r1".into(), "r2".into()]).to_string(),
            "web[r1,r2]"
        );
    }
}
