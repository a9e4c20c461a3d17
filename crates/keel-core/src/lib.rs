//! keel-core — shared types, configuration, and duration parsing.

pub mod config;
pub mod duration;
pub mod types;

pub use config::KeelConfig;
pub use duration::parse_duration;
pub use types::*;

/// Boxed, sendable future returned by the async seams (registry, probes,
/// workload handles) so they stay object-safe.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
