//! Submission policies: what a producer does when a bounded queue or executor
//! is saturated.
//!
//! All policies first try a non-blocking enqueue. They only differ once that
//! attempt reports the target as full:
//!
//! - [`SubmissionPolicy::Blocking`] waits for capacity, racing the caller's
//!   cancellation token.
//! - [`SubmissionPolicy::Rejecting`] fails immediately with
//!   [`EngineError::CapacityExceeded`].
//! - [`SubmissionPolicy::Offloading`] hands the unit of work to a fallback
//!   [`Offloader`] and returns without waiting.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result, SharedError};

/// A unit of work runnable by a [`WorkExecutor`].
pub type BoxTask = BoxFuture<'static, anyhow::Result<()>>;

/// Work handed to an [`Offloader`]. Failures inside it are already routed to
/// the caller's error handler.
pub type OffloadedTask = BoxFuture<'static, ()>;

/// Which side of an offloaded submission failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// The fallback refused or failed to take the work.
    Producer,
    /// The work itself failed once it ran.
    Action,
}

/// Receives every failure of an executor submission.
pub type ErrorHandler = Arc<dyn Fn(FailureStage, SharedError) + Send + Sync>;

/// Alternate execution path used by [`SubmissionPolicy::Offloading`].
pub trait Offloader: Send + Sync {
    fn offload(&self, task: OffloadedTask) -> anyhow::Result<()>;
}

impl<F> Offloader for F
where
    F: Fn(OffloadedTask) -> anyhow::Result<()> + Send + Sync,
{
    fn offload(&self, task: OffloadedTask) -> anyhow::Result<()> {
        self(task)
    }
}

impl Offloader for tokio::runtime::Handle {
    fn offload(&self, task: OffloadedTask) -> anyhow::Result<()> {
        self.spawn(task);
        Ok(())
    }
}

/// A bounded executor the policies can submit to.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Number of tasks that may wait for a worker.
    fn capacity(&self) -> usize;

    /// Submits without waiting; hands the task back when full or closed.
    fn try_execute(&self, task: BoxTask) -> std::result::Result<(), TrySendError<BoxTask>>;

    /// Submits, waiting for capacity.
    async fn execute(&self, task: BoxTask) -> Result<()>;
}

/// How a successful submission went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Accepted by the first non-blocking attempt.
    Direct,
    /// Accepted after waiting for capacity.
    AfterWait,
    /// Handed to the offloading fallback.
    Offloaded,
}

/// Backpressure policy, selected per call.
#[derive(Clone)]
pub enum SubmissionPolicy {
    Blocking,
    Rejecting,
    Offloading(Arc<dyn Offloader>),
}

impl SubmissionPolicy {
    pub fn offloading(offloader: impl Offloader + 'static) -> Self {
        Self::Offloading(Arc::new(offloader))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubmissionPolicy::Blocking => "blocking",
            SubmissionPolicy::Rejecting => "rejecting",
            SubmissionPolicy::Offloading(_) => "offloading",
        }
    }

    /// Enqueues `item` into `queue` according to this policy.
    ///
    /// Under `Offloading`, the offloaded task performs a waiting enqueue; if the
    /// queue closes before it succeeds the item is dropped, which a queue of
    /// completion-carrying items observes as abandonment.
    pub async fn submit_to_queue<T>(
        &self,
        queue: &mpsc::Sender<T>,
        item: T,
        cancel: &CancellationToken,
    ) -> Result<Submitted>
    where
        T: Send + 'static,
    {
        let item = match queue.try_send(item) {
            Ok(()) => return Ok(Submitted::Direct),
            Err(TrySendError::Closed(_)) => return Err(EngineError::QueueClosed),
            Err(TrySendError::Full(item)) => item,
        };

        match self {
            SubmissionPolicy::Blocking => {
                debug!("Queue full (capacity {}), waiting for a free slot", queue.max_capacity());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    permit = queue.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(item);
                            Ok(Submitted::AfterWait)
                        }
                        Err(_) => Err(EngineError::QueueClosed),
                    },
                }
            }
            SubmissionPolicy::Rejecting => Err(EngineError::CapacityExceeded {
                capacity: queue.max_capacity(),
            }),
            SubmissionPolicy::Offloading(offloader) => {
                let queue = queue.clone();
                let task: OffloadedTask = Box::pin(async move {
                    if queue.send(item).await.is_err() {
                        warn!("Offloaded enqueue dropped its item: queue closed");
                    }
                });
                offloader
                    .offload(task)
                    .map(|()| Submitted::Offloaded)
                    .map_err(|e| EngineError::Offload(Arc::new(e)))
            }
        }
    }

    /// Submits `task` to `executor` according to this policy.
    ///
    /// Whatever path the task takes, a failure of the task itself reaches
    /// `on_failure` as [`FailureStage::Action`]. Under `Offloading`, a failure
    /// of the fallback reaches it as [`FailureStage::Producer`]; both are
    /// delivered, never only one.
    pub async fn submit_to_executor<E>(
        &self,
        executor: &E,
        task: BoxTask,
        on_failure: ErrorHandler,
        cancel: &CancellationToken,
    ) -> Result<Submitted>
    where
        E: WorkExecutor + ?Sized,
    {
        let task = report_action_failure(task, on_failure.clone());

        let task = match executor.try_execute(task) {
            Ok(()) => return Ok(Submitted::Direct),
            Err(TrySendError::Closed(_)) => return Err(EngineError::QueueClosed),
            Err(TrySendError::Full(task)) => task,
        };

        match self {
            SubmissionPolicy::Blocking => {
                debug!("Executor '{}' saturated, waiting for capacity", executor.name());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    accepted = executor.execute(task) => accepted.map(|()| Submitted::AfterWait),
                }
            }
            SubmissionPolicy::Rejecting => Err(EngineError::CapacityExceeded {
                capacity: executor.capacity(),
            }),
            SubmissionPolicy::Offloading(offloader) => {
                let offloaded: OffloadedTask = Box::pin(async move {
                    // Action failures were already routed by the wrapper.
                    let _ = task.await;
                });
                if let Err(e) = offloader.offload(offloaded) {
                    warn!(
                        "Offloading fallback rejected work for executor '{}': {}",
                        executor.name(),
                        e
                    );
                    on_failure(FailureStage::Producer, Arc::new(e));
                }
                Ok(Submitted::Offloaded)
            }
        }
    }
}

impl fmt::Debug for SubmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn report_action_failure(task: BoxTask, on_failure: ErrorHandler) -> BoxTask {
    Box::pin(async move {
        if let Err(e) = task.await {
            on_failure(FailureStage::Action, Arc::new(e));
        }
        anyhow::Ok(())
    })
}
