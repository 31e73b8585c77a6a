//! Error types shared by every part of the engine.
//!
//! Work items and writers report failures as [`anyhow::Error`]. Once a failure
//! enters the engine it is wrapped in a [`SharedError`] so the same instance can
//! fail a caller's future *and* be recorded by a failure collector without
//! cloning the underlying error.

use std::sync::Arc;
use thiserror::Error;

/// A reference-counted failure; compare instances with [`Arc::ptr_eq`].
pub type SharedError = Arc<anyhow::Error>;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to producers and lifecycle owners.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Capacity exceeded: queue or executor is saturated (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("Orchestrator '{name}' is stopped or draining and does not accept work")]
    Stopped { name: String },

    #[error("Submission cancelled before the work was enqueued")]
    Cancelled,

    #[error("Queue closed: the consumer no longer accepts work")]
    QueueClosed,

    #[error("Index writer closed: {reason}")]
    WriterClosed { reason: String },

    #[error("Work failed: {0}")]
    Apply(SharedError),

    #[error("Commit failed: {0}")]
    CommitFailed(SharedError),

    #[error("Refresh failed: {0}")]
    RefreshFailed(SharedError),

    #[error("Offloading fallback failed: {0}")]
    Offload(SharedError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn stopped(name: impl Into<String>) -> Self {
        Self::Stopped { name: name.into() }
    }

    pub fn writer_closed(reason: impl Into<String>) -> Self {
        Self::WriterClosed {
            reason: reason.into(),
        }
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// The underlying failure instance, when this error wraps one.
    pub fn cause(&self) -> Option<&SharedError> {
        match self {
            EngineError::Apply(e)
            | EngineError::CommitFailed(e)
            | EngineError::RefreshFailed(e)
            | EngineError::Offload(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, EngineError::CapacityExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, EngineError::Stopped { .. })
    }
}

/// Returned by a work item or a writer when the writer itself can no longer be
/// trusted. The orchestrator aborts the current batch and reopens the writer.
#[derive(Error, Debug)]
#[error("Index writer corrupted: {message}")]
pub struct WriterCorrupted {
    pub message: String,
}

impl WriterCorrupted {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Whether `error` (or anything in its cause chain) is a [`WriterCorrupted`].
pub fn is_writer_corruption(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<WriterCorrupted>().is_some())
}

/// Aggregate error raised by `RootFailureCollector::check_no_failure`.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct FailureReport {
    /// Rendered, multi-line report.
    pub message: String,
    /// Every exception-carrying failure that was retained, in record order.
    pub suppressed: Vec<SharedError>,
    /// Total number of failures recorded, including elided ones.
    pub total: usize,
    /// Failures counted but not retained because the limit was reached.
    pub elided: usize,
}
