//! Index-work orchestration with configurable backpressure.
//!
//! Many concurrent producers submit index mutations; a single consumer per
//! index applies them in batches against one writer, committing and
//! refreshing on a schedule, while failures are gathered into a bounded,
//! hierarchical report.

pub mod backpressure;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod failure;
pub mod logging;
pub mod orchestrator;
pub mod work;

// Re-export commonly used types for convenience
pub use backpressure::{
    ErrorHandler, FailureStage, OffloadedTask, Offloader, SubmissionPolicy, Submitted, WorkExecutor,
};
pub use config::OrchestratorConfig;
pub use context::{IndexWriter, IndexWriterProvider, WorkExecutionContext};
pub use error::{EngineError, FailureReport, Result, SharedError, WriterCorrupted};
pub use executor::BoundedExecutor;
pub use failure::{ContextualFailureCollector, EventContext, RootFailureCollector};
pub use logging::{init_tracing, LogBuffer};
pub use orchestrator::{
    BatchingWorkOrchestrator, LifecycleState, OrchestratorStatsSnapshot, PreStopHandle,
};
pub use work::{CommitStrategy, RefreshStrategy, WorkHandle, WorkItem};
