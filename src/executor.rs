//! Fixed-size pool of tokio workers fed by a bounded queue.
//!
//! Serves as the executor side of the backpressure policies and, through its
//! [`Offloader`] implementation, as an offloading fallback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backpressure::{BoxTask, OffloadedTask, Offloader, WorkExecutor};
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct ExecutorStats {
    executed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatsSnapshot {
    pub executed: u64,
    pub failed: u64,
    pub queued: usize,
    pub workers: usize,
}

pub struct BoundedExecutor {
    name: String,
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<BoxTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    stats: Arc<ExecutorStats>,
    closed: AtomicBool,
}

impl BoundedExecutor {
    /// Spawns `workers` workers on the current runtime. `queue_size` tasks may
    /// wait in addition to those being run.
    pub fn new(name: impl Into<String>, workers: usize, queue_size: usize) -> Self {
        let name = name.into();
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);
        let (tx, rx) = mpsc::channel::<BoxTask>(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(ExecutorStats::default());

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let stats = stats.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    debug!("Executor '{}' worker {} started", name, worker_id);
                    loop {
                        let task = { rx.lock().await.recv().await };
                        let Some(task) = task else { break };
                        match task.await {
                            Ok(()) => {
                                stats.executed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                warn!("Executor '{}' task failed: {:#}", name, e);
                            }
                        }
                    }
                    debug!("Executor '{}' worker {} stopped", name, worker_id);
                })
            })
            .collect();

        info!(
            "Started executor '{}' ({} workers, queue size {})",
            name, workers, queue_size
        );

        Self {
            name,
            capacity: queue_size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            worker_count: workers,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    /// Pool sized to the machine, as the indexing workers are.
    pub fn with_default_workers(name: impl Into<String>, queue_size: usize) -> Self {
        Self::new(name, num_cpus::get().min(8), queue_size)
    }

    fn sender(&self) -> Option<mpsc::Sender<BoxTask>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Stops accepting tasks and waits until the queued ones have run.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Executor '{}' worker panicked: {}", self.name, e);
            }
        }
        info!("Executor '{}' shut down", self.name);
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        let queued = self
            .sender()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        ExecutorStatsSnapshot {
            executed: self.stats.executed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            queued,
            workers: self.worker_count,
        }
    }
}

#[async_trait]
impl WorkExecutor for BoundedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_execute(&self, task: BoxTask) -> std::result::Result<(), TrySendError<BoxTask>> {
        match self.sender() {
            Some(tx) => tx.try_send(task),
            None => Err(TrySendError::Closed(task)),
        }
    }

    async fn execute(&self, task: BoxTask) -> Result<()> {
        let tx = self.sender().ok_or(EngineError::QueueClosed)?;
        tx.send(task).await.map_err(|_| EngineError::QueueClosed)
    }
}

impl Offloader for BoundedExecutor {
    fn offload(&self, task: OffloadedTask) -> anyhow::Result<()> {
        let wrapped: BoxTask = Box::pin(async move {
            task.await;
            anyhow::Ok(())
        });
        match self.try_execute(wrapped) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!(
                "Executor '{}' is saturated (capacity {})",
                self.name,
                self.capacity
            )),
            Err(TrySendError::Closed(_)) => Err(anyhow!("Executor '{}' is shut down", self.name)),
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!("Executor '{}' dropped without shutdown", self.name);
        }
    }
}
