//! In-memory index shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use index_orchestrator::{
    BatchingWorkOrchestrator, CommitStrategy, IndexWriter, IndexWriterProvider,
    OrchestratorConfig, WorkItem, WriterCorrupted,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Semaphore};

/// Records everything the orchestrator does to the index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    pub applied: Mutex<Vec<(String, u64)>>,
    pub committed: Mutex<Vec<(String, u64)>>,
    pub commits: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub opens: AtomicUsize,
    pub open_writers: AtomicUsize,
    pub max_open_writers: AtomicUsize,
    failing_commits: AtomicUsize,
}

impl MemoryIndex {
    /// Sequence numbers applied for `key`, in apply order.
    pub fn applied_for(&self, key: &str) -> Vec<u64> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn committed_count(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    /// Makes the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

pub struct MemoryWriter {
    index: Arc<MemoryIndex>,
    pending: Vec<(String, u64)>,
}

impl MemoryWriter {
    fn record(&mut self, key: &str, seq: u64) {
        self.index
            .applied
            .lock()
            .unwrap()
            .push((key.to_string(), seq));
        self.pending.push((key.to_string(), seq));
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.index.open_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexWriter for MemoryWriter {
    async fn commit(&mut self) -> anyhow::Result<()> {
        let should_fail = self
            .index
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("simulated commit failure");
        }
        let pending = std::mem::take(&mut self.pending);
        self.index.committed.lock().unwrap().extend(pending);
        self.index.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&mut self) -> anyhow::Result<()> {
        self.index.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryProvider {
    index: Arc<MemoryIndex>,
}

#[async_trait]
impl IndexWriterProvider for MemoryProvider {
    type Writer = MemoryWriter;

    fn index_name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> anyhow::Result<MemoryWriter> {
        self.index.opens.fetch_add(1, Ordering::SeqCst);
        let open = self.index.open_writers.fetch_add(1, Ordering::SeqCst) + 1;
        self.index.max_open_writers.fetch_max(open, Ordering::SeqCst);
        Ok(MemoryWriter {
            index: self.index.clone(),
            pending: Vec::new(),
        })
    }
}

pub enum Behavior {
    Succeed,
    Fail(String),
    Corrupt,
    /// Signals `started` once dequeued, then waits for a permit of `gate`.
    Gated {
        gate: Arc<Semaphore>,
        started: Option<oneshot::Sender<()>>,
    },
}

pub struct Op {
    pub key: String,
    pub seq: u64,
    pub behavior: Behavior,
    pub commit: CommitStrategy,
}

impl Op {
    pub fn new(key: &str, seq: u64) -> Self {
        Self {
            key: key.to_string(),
            seq,
            behavior: Behavior::Succeed,
            commit: CommitStrategy::Deferred,
        }
    }

    pub fn failing(key: &str, seq: u64, message: &str) -> Self {
        Self {
            behavior: Behavior::Fail(message.to_string()),
            ..Self::new(key, seq)
        }
    }

    pub fn corrupting(key: &str, seq: u64) -> Self {
        Self {
            behavior: Behavior::Corrupt,
            ..Self::new(key, seq)
        }
    }

    /// An op holding the consumer until `gate` gets a permit.
    pub fn gated(key: &str, seq: u64, gate: Arc<Semaphore>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            behavior: Behavior::Gated {
                gate,
                started: Some(tx),
            },
            ..Self::new(key, seq)
        };
        (op, rx)
    }

    pub fn forcing_commit(mut self) -> Self {
        self.commit = CommitStrategy::Force;
        self
    }
}

#[async_trait]
impl WorkItem<MemoryWriter> for Op {
    type Output = u64;

    fn queuing_key(&self) -> &str {
        &self.key
    }

    fn describe(&self) -> String {
        format!("op {}#{}", self.key, self.seq)
    }

    fn commit_strategy(&self) -> CommitStrategy {
        self.commit
    }

    async fn apply(self, writer: &mut MemoryWriter) -> anyhow::Result<u64> {
        match self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail(message) => anyhow::bail!("{}", message),
            Behavior::Corrupt => return Err(WriterCorrupted::new("segment lost").into()),
            Behavior::Gated { gate, started } => {
                if let Some(started) = started {
                    let _ = started.send(());
                }
                gate.acquire().await?.forget();
            }
        }
        writer.record(&self.key, self.seq);
        Ok(self.seq)
    }
}

pub fn orchestrator(
    config: OrchestratorConfig,
) -> (BatchingWorkOrchestrator<MemoryProvider>, Arc<MemoryIndex>) {
    let index = Arc::new(MemoryIndex::default());
    let provider = MemoryProvider {
        index: index.clone(),
    };
    (
        BatchingWorkOrchestrator::new("test-orchestrator", provider, config),
        index,
    )
}

pub fn small_queue(queue_size: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        queue_size,
        ..OrchestratorConfig::default()
    }
}
