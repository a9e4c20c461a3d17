//! Health gate error types.

use std::time::Duration;

use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("{target} not healthy after {elapsed:?} (streak {streak})")]
    HealthTimeout {
        target: String,
        elapsed: Duration,
        streak: u32,
    },

    #[error("health gate cancelled")]
    Cancelled,
}
