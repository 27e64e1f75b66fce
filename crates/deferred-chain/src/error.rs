use thiserror::Error;

/// Errors from scheduler operations.
///
/// A [`DeferredChain`](crate::DeferredChain) itself never fails: it is either
/// pending or resolved. Only the loop driving it can refuse to continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task queue did not drain after {limit} tasks")]
    DrainLimitExceeded { limit: usize },

    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}
