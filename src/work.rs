//! Work items and their completion handles.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::context::{IndexWriterProvider, WorkExecutionContext};
use crate::error::{EngineError, Result, SharedError};

/// Durability requested by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStrategy {
    /// No commit needed on behalf of this item.
    None,
    /// Commit eventually, possibly coalesced with other items.
    #[default]
    Deferred,
    /// Commit at the end of the batch before completing the item.
    Force,
}

/// Visibility requested by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStrategy {
    None,
    #[default]
    Deferred,
    Force,
}

/// One index mutation, applied against the writer `W`.
///
/// Items with equal queuing keys are applied in submission order.
#[async_trait]
pub trait WorkItem<W>: Send + Sized + 'static {
    type Output: Send + 'static;

    fn queuing_key(&self) -> &str;

    fn describe(&self) -> String;

    fn commit_strategy(&self) -> CommitStrategy {
        CommitStrategy::Deferred
    }

    fn refresh_strategy(&self) -> RefreshStrategy {
        RefreshStrategy::Deferred
    }

    /// Applies the mutation. Return a [`crate::WriterCorrupted`] error (anywhere
    /// in the chain) when the writer can no longer be trusted.
    async fn apply(self, writer: &mut W) -> anyhow::Result<Self::Output>;
}

/// Result of applying one queued item, before its handle is completed.
pub(crate) enum ApplyOutcome {
    Applied,
    Failed { error: SharedError, writer_corrupted: bool },
}

/// Object-safe view of a queued item, as seen by the consumer loop.
#[async_trait]
pub(crate) trait QueuedWork<P: IndexWriterProvider>: Send {
    fn queuing_key(&self) -> &str;
    fn description(&self) -> &str;
    fn commit_strategy(&self) -> CommitStrategy;
    fn refresh_strategy(&self) -> RefreshStrategy;
    fn enqueued_at(&self) -> Instant;

    async fn apply(&mut self, ctx: &mut WorkExecutionContext<P>) -> ApplyOutcome;

    /// Completes the handle with the stored outcome, unless `batch_failure`
    /// overrides a successful one.
    fn complete(self: Box<Self>, batch_failure: Option<EngineError>);

    /// Fails the handle without applying the item.
    fn fail(self: Box<Self>, error: EngineError);
}

/// A work item paired with the sending half of its completion handle.
pub struct BatchedWork<I, T> {
    key: String,
    description: String,
    commit: CommitStrategy,
    refresh: RefreshStrategy,
    enqueued_at: Instant,
    item: Option<I>,
    result: Option<Result<T>>,
    completion: Option<oneshot::Sender<Result<T>>>,
}

impl<I, T> BatchedWork<I, T> {
    pub(crate) fn new<W>(item: I, orchestrator: &str) -> (Self, WorkHandle<T>)
    where
        I: WorkItem<W, Output = T>,
    {
        let (tx, rx) = oneshot::channel();
        let description = item.describe();
        let work = Self {
            key: item.queuing_key().to_string(),
            description: description.clone(),
            commit: item.commit_strategy(),
            refresh: item.refresh_strategy(),
            enqueued_at: Instant::now(),
            item: Some(item),
            result: None,
            completion: Some(tx),
        };
        let handle = WorkHandle {
            description,
            orchestrator: orchestrator.to_string(),
            receiver: rx,
        };
        (work, handle)
    }

    fn send(&mut self, outcome: Result<T>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have dropped its handle; nothing to notify then.
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl<P, I> QueuedWork<P> for BatchedWork<I, <I as WorkItem<P::Writer>>::Output>
where
    P: IndexWriterProvider,
    I: WorkItem<P::Writer>,
{
    fn queuing_key(&self) -> &str {
        &self.key
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn commit_strategy(&self) -> CommitStrategy {
        self.commit
    }

    fn refresh_strategy(&self) -> RefreshStrategy {
        self.refresh
    }

    fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    async fn apply(&mut self, ctx: &mut WorkExecutionContext<P>) -> ApplyOutcome {
        let Some(item) = self.item.take() else {
            return ApplyOutcome::Failed {
                error: Arc::new(anyhow::anyhow!("work '{}' applied twice", self.description)),
                writer_corrupted: false,
            };
        };
        match ctx.apply_work(item).await {
            Ok(output) => {
                self.result = Some(Ok(output));
                ApplyOutcome::Applied
            }
            Err(failure) => {
                self.result = Some(Err(EngineError::Apply(failure.error.clone())));
                ApplyOutcome::Failed {
                    error: failure.error,
                    writer_corrupted: failure.writer_corrupted,
                }
            }
        }
    }

    fn complete(mut self: Box<Self>, batch_failure: Option<EngineError>) {
        let outcome = match (self.result.take(), batch_failure) {
            (Some(Ok(_)), Some(failure)) => Err(failure),
            (Some(result), _) => result,
            (None, Some(failure)) => Err(failure),
            (None, None) => Err(EngineError::writer_closed(format!(
                "work '{}' completed without being applied",
                self.description
            ))),
        };
        self.send(outcome);
    }

    fn fail(mut self: Box<Self>, error: EngineError) {
        self.send(Err(error));
    }
}

/// Caller-side completion handle of a submitted item.
///
/// Resolves to the item's output once applied (and the batch's commit step
/// went through), or to the error that definitively failed it.
pub struct WorkHandle<T> {
    description: String,
    orchestrator: String,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> WorkHandle<T> {
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Non-blocking poll: `None` while the item is still pending.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(EngineError::stopped(self.orchestrator.clone())))
            }
        }
    }

    /// Waits at most `timeout`; `None` when the item is still pending.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        tokio::time::timeout(timeout, &mut *self).await.ok()
    }
}

impl<T> Future for WorkHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The work was dropped unapplied: the orchestrator went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::stopped(this.orchestrator.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for WorkHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("description", &self.description)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
