//! keel-health — the confirmation barrier between rollout steps.
//!
//! A `HealthGate` polls a `Probe` at a fixed interval until it has seen
//! enough consecutive healthy samples, the timeout elapses, or the caller
//! cancels.
//!
//! # Poll sequence
//!
//! ```text
//! Polling ──Healthy×N──▶ Confirmed
//!    │
//!    ├──deadline──▶ TimedOut
//!    └──cancel────▶ Cancelled   (checked between probes, never mid-probe)
//! ```
//!
//! Unhealthy samples reset the streak. Unknown samples (probe errors)
//! neither reset nor advance it.

pub mod checker;
pub mod error;
pub mod gate;

pub use checker::{http_probe, HealthSample, HealthStatus, HttpProbe, ProbeResult, StreakTracker};
pub use error::{HealthError, HealthResult};
pub use gate::{HealthGate, HealthGateConfig, Probe, ProbeTarget};
