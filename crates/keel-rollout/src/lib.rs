//! keel-rollout — progressive rollouts with health gates and rollback.
//!
//! This crate coordinates a release: resolve the revision to an immutable
//! artifact, plan replica-count transitions within a surge budget, apply
//! them step by step behind a health gate, and roll back when a gate times
//! out.
//!
//! # Components
//!
//! - **`planner`** — step sequence from current to desired replicas
//! - **`controller`** — rollout state machine (advance, pause, cancel, rollback)
//! - **`registry`** — one live controller per target, caller handles
//! - **`workload`** — the narrow cluster interface the controller drives
//! - **`events`** — state, status snapshots, and the JSON event stream
//! - **`strategy`** — rollout and retry policy
//! - **`simulated`** — in-memory workload

pub mod controller;
pub mod error;
pub mod events;
pub mod planner;
pub mod registry;
pub mod simulated;
pub mod strategy;
pub mod workload;

pub use controller::RolloutController;
pub use error::{RolloutError, RolloutResult};
pub use events::{EventKind, RolloutEvent, RolloutState, RolloutStatus};
pub use planner::{RolloutPlan, RolloutPlanner, Step};
pub use registry::{RolloutHandle, RolloutRegistry};
pub use simulated::SimulatedWorkload;
pub use strategy::{RetryPolicy, RolloutPolicy, RolloutRequest};
pub use workload::{Replica, ReplicaId, WorkloadError, WorkloadHandle, WorkloadProbe};
