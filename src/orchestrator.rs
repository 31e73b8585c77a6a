//! Batching work orchestrator.
//!
//! Producers submit work items into bounded lanes, chosen by hashing the
//! queuing key. A single consumer task per orchestrator drains the lanes in
//! batches, applies every item through its [`WorkExecutionContext`] and then
//! commits or refreshes according to the configured intervals and the
//! strategies the items of the batch requested.
//!
//! The consumer is the only owner of the writer. Forced commits, forced
//! refreshes and drain requests are sent to it as control messages and
//! acknowledged once performed, so no other task ever touches the writer.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backpressure::{SubmissionPolicy, Submitted};
use crate::config::OrchestratorConfig;
use crate::context::{IndexWriterProvider, WorkExecutionContext};
use crate::error::{EngineError, Result, SharedError};
use crate::failure::{ContextualFailureCollector, EventContext, RootFailureCollector};
use crate::work::{
    ApplyOutcome, BatchedWork, CommitStrategy, QueuedWork, RefreshStrategy, WorkHandle, WorkItem,
};

type Work<P> = Box<dyn QueuedWork<P>>;
type Ack = oneshot::Sender<Result<()>>;

/// Lifecycle of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    /// No longer accepting work; queued items are still being applied.
    Draining,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
        };
        f.write_str(state)
    }
}

/// Counters updated by producers and the consumer.
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) applied: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) offloaded: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) refreshes: AtomicU64,
    pub(crate) writer_reopens: AtomicU64,
    pub(crate) writer_discards: AtomicU64,
}

impl OrchestratorStats {
    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            offloaded: self.offloaded.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            writer_reopens: self.writer_reopens.load(Ordering::Relaxed),
            writer_discards: self.writer_discards.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatsSnapshot {
    pub submitted: u64,
    pub applied: u64,
    pub failed: u64,
    pub rejected: u64,
    pub offloaded: u64,
    pub batches: u64,
    pub commits: u64,
    pub refreshes: u64,
    pub writer_reopens: u64,
    pub writer_discards: u64,
}

enum Control {
    Commit(Ack),
    Refresh(Ack),
    Drain(Ack),
}

struct Channels<P: IndexWriterProvider> {
    lanes: Vec<mpsc::Sender<Work<P>>>,
    control: mpsc::UnboundedSender<Control>,
}

impl<P: IndexWriterProvider> Clone for Channels<P> {
    fn clone(&self) -> Self {
        Self {
            lanes: self.lanes.clone(),
            control: self.control.clone(),
        }
    }
}

struct Shared<P: IndexWriterProvider> {
    state: LifecycleState,
    channels: Option<Channels<P>>,
}

/// Applies work items against the single writer of one index.
pub struct BatchingWorkOrchestrator<P: IndexWriterProvider> {
    name: String,
    provider: Arc<P>,
    config: OrchestratorConfig,
    failures: RootFailureCollector,
    stats: Arc<OrchestratorStats>,
    shared: RwLock<Shared<P>>,
    consumer: Mutex<Option<JoinHandle<WorkExecutionContext<P>>>>,
}

impl<P: IndexWriterProvider> BatchingWorkOrchestrator<P> {
    pub fn new(name: impl Into<String>, provider: P, config: OrchestratorConfig) -> Self {
        let name = name.into();
        let failures = RootFailureCollector::with_limit(name.clone(), config.failure_limit);
        Self::with_failure_collector(name, provider, config, failures)
    }

    /// Reports failures into `failures` instead of a collector of its own.
    pub fn with_failure_collector(
        name: impl Into<String>,
        provider: P,
        config: OrchestratorConfig,
        failures: RootFailureCollector,
    ) -> Self {
        Self {
            name: name.into(),
            provider: Arc::new(provider),
            config,
            failures,
            stats: Arc::new(OrchestratorStats::default()),
            shared: RwLock::new(Shared {
                state: LifecycleState::Stopped,
                channels: None,
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn failures(&self) -> &RootFailureCollector {
        &self.failures
    }

    pub fn stats(&self) -> OrchestratorStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn state(&self) -> LifecycleState {
        self.shared.read().await.state
    }

    fn consumer_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<WorkExecutionContext<P>>>> {
        self.consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the consumer with fresh queues. Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        let mut shared = self.shared.write().await;
        match shared.state {
            LifecycleState::Running | LifecycleState::Starting => return Ok(()),
            LifecycleState::Draining => return Err(EngineError::stopped(&self.name)),
            LifecycleState::Stopped => {}
        }
        self.config.validate().map_err(EngineError::config)?;
        shared.state = LifecycleState::Starting;

        let (lanes, receivers): (Vec<_>, Vec<_>) = (0..self.config.queue_count)
            .map(|_| mpsc::channel::<Work<P>>(self.config.queue_size))
            .unzip();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let failures = self
            .failures
            .with_context(EventContext::index(self.provider.index_name()));
        let ctx = WorkExecutionContext::new(
            self.provider.clone(),
            failures.clone(),
            self.stats.clone(),
            self.config.commit_interval(),
            self.config.refresh_interval(),
        );
        let consumer = Consumer {
            name: self.name.clone(),
            ctx,
            lanes: receivers.into_iter().map(Some).collect(),
            control: control_rx,
            control_open: true,
            failures,
            stats: self.stats.clone(),
            batch_size: self.config.batch_size,
            next_lane: 0,
            draining: false,
            drain_waiters: Vec::new(),
            drained: None,
            commit_due: None,
            refresh_due: None,
        };
        *self.consumer_slot() = Some(tokio::spawn(consumer.run()));

        shared.channels = Some(Channels {
            lanes,
            control: control_tx,
        });
        shared.state = LifecycleState::Running;
        info!(
            "Orchestrator '{}' started ({} lane(s) of {} slot(s), batches of {})",
            self.name, self.config.queue_count, self.config.queue_size, self.config.batch_size
        );
        Ok(())
    }

    fn lane_for(&self, key: &str, lanes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % lanes as u64) as usize
    }

    pub async fn submit<I>(
        &self,
        item: I,
        policy: &SubmissionPolicy,
    ) -> Result<WorkHandle<<I as WorkItem<P::Writer>>::Output>>
    where
        I: WorkItem<P::Writer>,
    {
        self.submit_with_cancel(item, policy, &CancellationToken::new())
            .await
    }

    /// Enqueues `item` under `policy`. A wait for capacity aborts with
    /// [`EngineError::Cancelled`] once `cancel` fires; the item is then never
    /// applied.
    pub async fn submit_with_cancel<I>(
        &self,
        item: I,
        policy: &SubmissionPolicy,
        cancel: &CancellationToken,
    ) -> Result<WorkHandle<<I as WorkItem<P::Writer>>::Output>>
    where
        I: WorkItem<P::Writer>,
    {
        let lane = {
            let shared = self.shared.read().await;
            match (&shared.state, &shared.channels) {
                (LifecycleState::Running, Some(channels)) => {
                    let index = self.lane_for(item.queuing_key(), channels.lanes.len());
                    channels.lanes[index].clone()
                }
                _ => return Err(EngineError::stopped(&self.name)),
            }
        };

        let (work, handle) = BatchedWork::new::<P::Writer>(item, &self.name);
        let work: Work<P> = Box::new(work);
        debug!(
            "Submitting '{}' to orchestrator '{}' ({} policy)",
            handle.description(),
            self.name,
            policy.name()
        );

        match policy.submit_to_queue(&lane, work, cancel).await {
            Ok(submitted) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                if submitted == Submitted::Offloaded {
                    self.stats.offloaded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(handle)
            }
            Err(EngineError::QueueClosed) => Err(EngineError::stopped(&self.name)),
            Err(e) => {
                if e.is_capacity_exceeded() {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    async fn send_control(&self, make: impl FnOnce(Ack) -> Control) -> Result<()> {
        let control = {
            let shared = self.shared.read().await;
            match (&shared.state, &shared.channels) {
                (LifecycleState::Running | LifecycleState::Draining, Some(channels)) => {
                    channels.control.clone()
                }
                _ => return Err(EngineError::stopped(&self.name)),
            }
        };
        let (tx, rx) = oneshot::channel();
        control
            .send(make(tx))
            .map_err(|_| EngineError::stopped(&self.name))?;
        rx.await.map_err(|_| EngineError::stopped(&self.name))?
    }

    /// Commits everything applied so far and returns once it is durable.
    ///
    /// Performed by the consumer between two items, so it never races a
    /// background commit.
    pub async fn force_commit(&self) -> Result<()> {
        self.send_control(Control::Commit).await
    }

    /// Refreshes everything applied so far and returns once it is visible.
    pub async fn force_refresh(&self) -> Result<()> {
        self.send_control(Control::Refresh).await
    }

    /// Stops accepting work and starts draining. The returned handle resolves
    /// once every queued item was applied and the final commit happened.
    pub async fn pre_stop(&self) -> PreStopHandle {
        let mut shared = self.shared.write().await;
        let control = match (&shared.state, &shared.channels) {
            (LifecycleState::Running | LifecycleState::Draining, Some(channels)) => {
                channels.control.clone()
            }
            _ => return PreStopHandle::ready(&self.name),
        };
        if shared.state == LifecycleState::Running {
            info!("Orchestrator '{}' draining", self.name);
        }
        shared.state = LifecycleState::Draining;

        let (tx, rx) = oneshot::channel();
        if control.send(Control::Drain(tx)).is_err() {
            return PreStopHandle::ready(&self.name);
        }
        PreStopHandle {
            name: self.name.clone(),
            receiver: Some(rx),
        }
    }

    /// Drains, then releases the writer. The orchestrator may be started
    /// again afterwards.
    pub async fn stop(&self) -> Result<()> {
        let drain = self.pre_stop().await;
        let drain_timeout = self.config.drain_timeout();
        let (mut outcome, timed_out) = if drain_timeout.is_zero() {
            (drain.await, false)
        } else {
            match tokio::time::timeout(drain_timeout, drain).await {
                Ok(outcome) => (outcome, false),
                Err(_) => {
                    warn!(
                        "Orchestrator '{}' did not drain within {:?}, aborting",
                        self.name, drain_timeout
                    );
                    (
                        Err(EngineError::writer_closed(format!(
                            "drain timed out after {drain_timeout:?}"
                        ))),
                        true,
                    )
                }
            }
        };

        self.shared.write().await.channels = None;
        let consumer = self.consumer_slot().take();
        if let Some(consumer) = consumer {
            if timed_out {
                consumer.abort();
            }
            match consumer.await {
                Ok(mut ctx) => {
                    if let Err(e) = ctx.close().await {
                        error!("Orchestrator '{}' failed to close its writer: {:#}", self.name, e);
                        outcome = outcome.and(Err(EngineError::CommitFailed(e)));
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("Orchestrator '{}' consumer panicked: {}", self.name, e);
                    outcome = outcome.and(Err(EngineError::writer_closed("consumer panicked")));
                }
            }
        }

        self.shared.write().await.state = LifecycleState::Stopped;
        info!("Orchestrator '{}' stopped", self.name);
        outcome
    }
}

/// Resolves once a drain requested by [`BatchingWorkOrchestrator::pre_stop`]
/// has completed.
pub struct PreStopHandle {
    name: String,
    receiver: Option<oneshot::Receiver<Result<()>>>,
}

impl PreStopHandle {
    fn ready(name: &str) -> Self {
        Self {
            name: name.to_string(),
            receiver: None,
        }
    }
}

impl Future for PreStopHandle {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::writer_closed(format!(
                "consumer of '{}' exited before draining",
                this.name
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Event<P: IndexWriterProvider> {
    Control(Option<Control>),
    Work(usize, Option<Work<P>>),
    Deadline,
}

/// The single consumer: owns the execution context, hence the writer.
struct Consumer<P: IndexWriterProvider> {
    name: String,
    ctx: WorkExecutionContext<P>,
    lanes: Vec<Option<mpsc::Receiver<Work<P>>>>,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    failures: Arc<ContextualFailureCollector>,
    stats: Arc<OrchestratorStats>,
    batch_size: usize,
    next_lane: usize,
    draining: bool,
    drain_waiters: Vec<Ack>,
    drained: Option<Result<()>>,
    commit_due: Option<Instant>,
    refresh_due: Option<Instant>,
}

/// Waits for the head of any open lane. `None` in the result means that lane
/// is closed and empty.
async fn next_work<P: IndexWriterProvider>(
    lanes: &mut [Option<mpsc::Receiver<Work<P>>>],
) -> (usize, Option<Work<P>>) {
    let waits: Vec<_> = lanes
        .iter_mut()
        .enumerate()
        .filter_map(|(index, lane)| {
            lane.as_mut()
                .map(|rx| Box::pin(async move { (index, rx.recv().await) }))
        })
        .collect();
    if waits.is_empty() {
        return futures::future::pending().await;
    }
    futures::future::select_all(waits).await.0
}

impl<P: IndexWriterProvider> Consumer<P> {
    async fn run(mut self) -> WorkExecutionContext<P> {
        debug!("Orchestrator '{}' consumer started", self.name);
        loop {
            let deadline = match (self.commit_due, self.refresh_due) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (due, None) | (None, due) => due,
            };
            let far_future = Instant::now() + Duration::from_secs(86_400);

            let event = tokio::select! {
                biased;
                control = self.control.recv(), if self.control_open => Event::Control(control),
                (lane, work) = next_work(&mut self.lanes) => Event::Work(lane, work),
                _ = tokio::time::sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => Event::Deadline,
            };

            match event {
                Event::Control(Some(control)) => self.handle_control(control).await,
                Event::Control(None) => {
                    // Orchestrator dropped: flush what is queued, then exit.
                    self.control_open = false;
                    self.begin_drain();
                }
                Event::Work(lane, Some(work)) => {
                    self.next_lane = (lane + 1) % self.lanes.len();
                    let batch = self.collect_batch(vec![work]);
                    self.process_batch(batch).await;
                }
                Event::Work(lane, None) => {
                    self.lanes[lane] = None;
                    if self.lanes.iter().all(Option::is_none) {
                        self.finish().await;
                        break;
                    }
                }
                Event::Deadline => self.flush_due().await,
            }
        }

        // Answer what raced with the end of the drain; later sends fail.
        self.control.close();
        while let Ok(control) = self.control.try_recv() {
            self.handle_control(control).await;
        }
        debug!("Orchestrator '{}' consumer exited", self.name);
        self.ctx
    }

    /// Tops `batch` up from the lanes, round robin, without waiting.
    fn collect_batch(&mut self, mut batch: Vec<Work<P>>) -> Vec<Work<P>> {
        let lane_count = self.lanes.len();
        loop {
            let mut progressed = false;
            for offset in 0..lane_count {
                if batch.len() >= self.batch_size {
                    return batch;
                }
                let index = (self.next_lane + offset) % lane_count;
                if let Some(rx) = self.lanes[index].as_mut() {
                    if let Ok(work) = rx.try_recv() {
                        batch.push(work);
                        progressed = true;
                    }
                }
            }
            self.next_lane = (self.next_lane + 1) % lane_count;
            if !progressed {
                return batch;
            }
        }
    }

    async fn process_batch(&mut self, batch: Vec<Work<P>>) {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Orchestrator '{}' applying batch of {} item(s)",
            self.name,
            batch.len()
        );

        let mut force_commit = false;
        let mut force_refresh = false;
        let mut processed = Vec::with_capacity(batch.len());
        let mut pending = batch.into_iter();
        let mut corruption: Option<SharedError> = None;

        for mut work in pending.by_ref() {
            force_commit |= work.commit_strategy() == CommitStrategy::Force;
            force_refresh |= work.refresh_strategy() == RefreshStrategy::Force;
            let outcome = work.apply(&mut self.ctx).await;
            match outcome {
                ApplyOutcome::Applied => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    processed.push(work);
                }
                ApplyOutcome::Failed {
                    error,
                    writer_corrupted,
                } => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Orchestrator '{}' failed to apply {} (waited {:?}): {:#}",
                        self.name,
                        work.description(),
                        work.enqueued_at().elapsed(),
                        error
                    );
                    self.failures
                        .with_context(EventContext::document(work.queuing_key()))
                        .add_with_message(
                            format!("Failed to apply {}", work.description()),
                            error.clone(),
                        );
                    processed.push(work);
                    if writer_corrupted {
                        corruption = Some(error);
                        break;
                    }
                }
            }
        }

        if let Some(cause) = corruption {
            let remaining: Vec<_> = pending.collect();
            error!(
                "Orchestrator '{}' writer corrupted, failing {} queued item(s) of the batch",
                self.name,
                remaining.len()
            );
            self.ctx.clean_up_after_failure(&cause, "applying batch").await;
            self.commit_due = None;
            self.refresh_due = None;
            let discarded =
                EngineError::writer_closed(format!("changes discarded after writer corruption: {cause}"));
            for work in processed {
                work.complete(Some(discarded.clone()));
            }
            let closed =
                EngineError::writer_closed(format!("writer corrupted earlier in the batch: {cause}"));
            for work in remaining {
                work.fail(closed.clone());
            }
            return;
        }

        let batch_failure = self.end_batch(force_commit, force_refresh).await;
        if batch_failure.is_none() {
            // Completed below as successful even if the commit was only scheduled.
            self.ctx.acknowledge_uncommitted();
        }
        for work in processed {
            work.complete(batch_failure.clone());
        }
    }

    /// Commit then refresh for the batch just applied. A failure discards the
    /// writer and is returned to fail the items of the batch.
    async fn end_batch(&mut self, force_commit: bool, force_refresh: bool) -> Option<EngineError> {
        let committed = if force_commit {
            self.ctx.commit().await.map(|()| None)
        } else {
            self.ctx.commit_or_delay().await
        };
        match committed {
            Ok(delay) => self.commit_due = delay.map(|d| Instant::now() + d),
            Err(cause) => {
                self.ctx.clean_up_after_failure(&cause, "commit").await;
                self.commit_due = None;
                self.refresh_due = None;
                return Some(EngineError::CommitFailed(cause));
            }
        }

        let refreshed = if force_refresh {
            self.ctx.refresh().await.map(|()| None)
        } else {
            self.ctx.refresh_or_delay().await
        };
        match refreshed {
            Ok(delay) => {
                self.refresh_due = delay.map(|d| Instant::now() + d);
                None
            }
            Err(cause) => {
                self.ctx.clean_up_after_failure(&cause, "refresh").await;
                self.commit_due = None;
                self.refresh_due = None;
                Some(EngineError::RefreshFailed(cause))
            }
        }
    }

    /// Performs the deferred commit or refresh that became due.
    async fn flush_due(&mut self) {
        let now = Instant::now();
        if self.commit_due.is_some_and(|due| due <= now) {
            self.commit_due = None;
            match self.ctx.commit_or_delay().await {
                Ok(delay) => self.commit_due = delay.map(|d| Instant::now() + d),
                Err(cause) => {
                    self.ctx.clean_up_after_failure(&cause, "deferred commit").await;
                    self.refresh_due = None;
                    return;
                }
            }
        }
        if self.refresh_due.is_some_and(|due| due <= now) {
            self.refresh_due = None;
            match self.ctx.refresh_or_delay().await {
                Ok(delay) => self.refresh_due = delay.map(|d| Instant::now() + d),
                Err(cause) => {
                    self.ctx.clean_up_after_failure(&cause, "deferred refresh").await;
                    self.commit_due = None;
                }
            }
        }
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Commit(ack) => {
                let outcome = match self.ctx.commit().await {
                    Ok(()) => {
                        self.commit_due = None;
                        Ok(())
                    }
                    Err(cause) => {
                        self.ctx.clean_up_after_failure(&cause, "forced commit").await;
                        self.commit_due = None;
                        self.refresh_due = None;
                        Err(EngineError::CommitFailed(cause))
                    }
                };
                let _ = ack.send(outcome);
            }
            Control::Refresh(ack) => {
                let outcome = match self.ctx.refresh().await {
                    Ok(()) => {
                        self.refresh_due = None;
                        Ok(())
                    }
                    Err(cause) => {
                        self.ctx.clean_up_after_failure(&cause, "forced refresh").await;
                        self.commit_due = None;
                        self.refresh_due = None;
                        Err(EngineError::RefreshFailed(cause))
                    }
                };
                let _ = ack.send(outcome);
            }
            Control::Drain(ack) => match &self.drained {
                Some(outcome) => {
                    let _ = ack.send(outcome.clone());
                }
                None => {
                    self.begin_drain();
                    self.drain_waiters.push(ack);
                }
            },
        }
    }

    /// Closes every lane: blocked producers fail, queued items still arrive.
    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        for rx in self.lanes.iter_mut().flatten() {
            rx.close();
        }
        debug!("Orchestrator '{}' lanes closed for draining", self.name);
    }

    /// Final commit and refresh once every lane is closed and empty.
    async fn finish(&mut self) {
        let outcome = match self.ctx.commit().await {
            Ok(()) => match self.ctx.refresh().await {
                Ok(()) => Ok(()),
                Err(cause) => {
                    self.ctx.clean_up_after_failure(&cause, "final refresh").await;
                    Err(EngineError::RefreshFailed(cause))
                }
            },
            Err(cause) => {
                self.ctx.clean_up_after_failure(&cause, "final commit").await;
                Err(EngineError::CommitFailed(cause))
            }
        };
        self.commit_due = None;
        self.refresh_due = None;
        info!("Orchestrator '{}' drained", self.name);
        for ack in self.drain_waiters.drain(..) {
            let _ = ack.send(outcome.clone());
        }
        self.drained = Some(outcome);
    }
}
