use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum MetricsError {
    #[error("{0} has already been disposed")]
    AlreadyDisposed(&'static str),

    #[error("Failed to start polling loop: {0}")]
    LoopStart(String),

    #[error("Invalid polling period: {0:?}")]
    InvalidPeriod(Duration),

    #[error("Capacity must be non-zero")]
    InvalidCapacity,

    #[error("No collector registered for metric `{0}`")]
    UnknownMetric(String),

    /// A collector failed. Shared so every caller waiting on the same
    /// invocation receives the same error.
    #[error("Collection failed: {0:#}")]
    Collection(Arc<anyhow::Error>),
}

pub type Result<T, E = MetricsError> = std::result::Result<T, E>;
