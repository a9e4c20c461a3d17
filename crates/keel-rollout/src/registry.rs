//! Rollout registry. One active controller per target.
//!
//! The registry is an explicit table owned by whoever coordinates rollouts
//! (the CLI, a daemon). Starting a rollout for a target that already has a
//! live controller is rejected with `RolloutInProgress`, never queued.
//! Entries are removed when their controller reaches a terminal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info};

use keel_artifact::ArtifactResolver;

use crate::controller::RolloutController;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventSink, RolloutEvent, RolloutState, RolloutStatus};
use crate::strategy::RolloutRequest;
use crate::workload::WorkloadHandle;

const EVENT_CAPACITY: usize = 1024;

/// Caller-side handle to a running rollout.
///
/// Cheap to clone. Status can be polled with [`status`](Self::status) or
/// awaited with [`wait`](Self::wait).
#[derive(Clone)]
pub struct RolloutHandle {
    id: String,
    target: String,
    status: watch::Receiver<RolloutStatus>,
    pause: Arc<watch::Sender<bool>>,
    cancel: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<RolloutEvent>,
    /// Receiver subscribed before the controller started, so the first
    /// subscriber sees the stream from its first event.
    first_subscriber: Arc<Mutex<Option<broadcast::Receiver<RolloutEvent>>>>,
}

impl RolloutHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn status(&self) -> RolloutStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> RolloutState {
        self.status.borrow().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Ask the controller to pause at the next step boundary.
    pub fn pause(&self) {
        if !self.is_finished() {
            debug!(rollout = %self.id, "pause requested");
            self.pause.send_replace(true);
        }
    }

    pub fn resume(&self) {
        debug!(rollout = %self.id, "resume requested");
        self.pause.send_replace(false);
    }

    /// Ask the controller to stop. Observed at the next step boundary or
    /// health-poll tick; applied steps are rolled back best-effort and the
    /// rollout ends `Failed`.
    pub fn cancel(&self) {
        if !self.is_finished() {
            info!(rollout = %self.id, "cancel requested");
            self.cancel.send_replace(true);
        }
    }

    /// Subscribe to the event stream. The first call receives every event
    /// since the rollout started; later calls see events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        let first = self
            .first_subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        first.unwrap_or_else(|| self.events.subscribe())
    }

    /// Wait for a terminal state and return the final snapshot.
    pub async fn wait(&self) -> RolloutStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| s.state.is_terminal()).await {
            return (*status).clone();
        }
        // The controller is gone; its last snapshot is final.
        rx.borrow().clone()
    }
}

/// Keyed table of active rollouts, one per target.
#[derive(Clone)]
pub struct RolloutRegistry {
    resolver: Arc<ArtifactResolver>,
    active: Arc<RwLock<HashMap<String, RolloutHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl RolloutRegistry {
    pub fn new(resolver: Arc<ArtifactResolver>) -> Self {
        Self {
            resolver,
            active: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn resolver(&self) -> &Arc<ArtifactResolver> {
        &self.resolver
    }

    /// Start a rollout against `workload` and return its handle.
    ///
    /// Fails with `RolloutInProgress` if `request.target` already has a
    /// non-terminal rollout.
    pub async fn start(
        &self,
        request: RolloutRequest,
        workload: Arc<dyn WorkloadHandle>,
    ) -> RolloutResult<RolloutHandle> {
        let target = request.target.clone();
        let mut active = self.active.write().await;

        if let Some(existing) = active.get(&target) {
            if !existing.is_finished() {
                info!(%target, rollout = %existing.id, "rejecting concurrent rollout");
                return Err(RolloutError::RolloutInProgress { target });
            }
        }

        let id = format!("{target}-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (status_tx, status_rx) =
            watch::channel(RolloutStatus::new(&id, &target, &request.revision));
        let (pause_tx, pause_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, first_rx) = broadcast::channel(EVENT_CAPACITY);

        let handle = RolloutHandle {
            id: id.clone(),
            target: target.clone(),
            status: status_rx,
            pause: Arc::new(pause_tx),
            cancel: Arc::new(cancel_tx),
            events: events_tx.clone(),
            first_subscriber: Arc::new(Mutex::new(Some(first_rx))),
        };

        let controller = RolloutController::new(
            request,
            workload,
            self.resolver.clone(),
            status_tx,
            EventSink::new(&id, &target, events_tx),
            pause_rx,
            cancel_rx,
        );

        active.insert(target.clone(), handle.clone());
        drop(active);

        let table = self.active.clone();
        tokio::spawn(async move {
            let status = controller.run().await;
            let mut active = table.write().await;
            if active.get(&status.target).is_some_and(|h| h.id == status.rollout_id) {
                active.remove(&status.target);
            }
            debug!(target = %status.target, rollout = %status.rollout_id, "rollout released");
        });

        info!(%target, rollout = %id, "rollout started");
        Ok(handle)
    }

    /// Handle for the target's active rollout, if any.
    pub async fn get(&self, target: &str) -> Option<RolloutHandle> {
        self.active.read().await.get(target).cloned()
    }

    /// Targets with a live rollout.
    pub async fn active(&self) -> Vec<String> {
        let active = self.active.read().await;
        let mut targets: Vec<String> = active
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
    }

    /// Cancel every live rollout (for shutdown).
    pub async fn cancel_all(&self) {
        for handle in self.active.read().await.values() {
            handle.cancel();
        }
    }
}
