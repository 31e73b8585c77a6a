//! The resource one orchestrator turn works with: the index writer.
//!
//! A [`WorkExecutionContext`] is owned by exactly one consumer loop. It opens
//! the writer lazily, applies items against it, coalesces commits and
//! refreshes, and discards the writer after a fatal failure so the next batch
//! starts from a freshly opened one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::{is_writer_corruption, SharedError};
use crate::failure::ContextualFailureCollector;
use crate::orchestrator::OrchestratorStats;
use crate::work::WorkItem;

/// Single-writer handle on an index.
#[async_trait]
pub trait IndexWriter: Send + Sized + 'static {
    /// Makes applied changes durable. Must not return before they are.
    async fn commit(&mut self) -> anyhow::Result<()>;

    /// Makes applied changes visible to readers.
    async fn refresh(&mut self) -> anyhow::Result<()>;

    /// Releases the writer after a successful final commit.
    async fn close(self) -> anyhow::Result<()> {
        drop(self);
        Ok(())
    }

    /// Drops the writer and any uncommitted change after a failure.
    async fn discard(self) -> anyhow::Result<()> {
        drop(self);
        Ok(())
    }
}

/// Opens writers for one index.
#[async_trait]
pub trait IndexWriterProvider: Send + Sync + 'static {
    type Writer: IndexWriter;

    fn index_name(&self) -> &str;

    async fn open(&self) -> anyhow::Result<Self::Writer>;
}

/// Why applying an item failed.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub error: SharedError,
    /// The writer must be discarded before anything else is applied.
    pub writer_corrupted: bool,
}

pub struct WorkExecutionContext<P: IndexWriterProvider> {
    provider: Arc<P>,
    writer: Option<P::Writer>,
    failures: Arc<ContextualFailureCollector>,
    stats: Arc<OrchestratorStats>,
    commit_interval: Duration,
    refresh_interval: Duration,
    uncommitted: bool,
    unrefreshed: bool,
    /// Items applied successfully since the last commit.
    uncommitted_items: usize,
    /// Part of `uncommitted_items` whose callers were already told it succeeded.
    acknowledged_items: usize,
    last_commit: Instant,
    last_refresh: Instant,
    opened_before: bool,
}

impl<P: IndexWriterProvider> WorkExecutionContext<P> {
    pub fn new(
        provider: Arc<P>,
        failures: Arc<ContextualFailureCollector>,
        stats: Arc<OrchestratorStats>,
        commit_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            provider,
            writer: None,
            failures,
            stats,
            commit_interval,
            refresh_interval,
            uncommitted: false,
            unrefreshed: false,
            uncommitted_items: 0,
            acknowledged_items: 0,
            last_commit: now,
            last_refresh: now,
            opened_before: false,
        }
    }

    pub fn index_name(&self) -> &str {
        self.provider.index_name()
    }

    pub fn is_writer_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.uncommitted
    }

    pub fn has_unrefreshed_changes(&self) -> bool {
        self.unrefreshed
    }

    /// Successfully applied items the writer holds without a commit.
    pub fn uncommitted_items(&self) -> usize {
        self.uncommitted_items
    }

    /// Marks every uncommitted item as reported successful to its caller.
    /// Losing them later is then recorded by [`Self::clean_up_after_failure`].
    pub fn acknowledge_uncommitted(&mut self) {
        self.acknowledged_items = self.uncommitted_items;
    }

    async fn ensure_writer(&mut self) -> Result<(), SharedError> {
        if self.writer.is_some() {
            return Ok(());
        }
        let writer = self.provider.open().await.map_err(Arc::new)?;
        if self.opened_before {
            self.stats.writer_reopens.fetch_add(1, Ordering::Relaxed);
            info!("Reopened index writer for '{}'", self.provider.index_name());
        } else {
            debug!("Opened index writer for '{}'", self.provider.index_name());
        }
        self.opened_before = true;
        self.writer = Some(writer);
        Ok(())
    }

    /// Applies one item. A writer that cannot be opened counts as corrupted.
    pub async fn apply_work<I>(&mut self, item: I) -> Result<I::Output, ApplyFailure>
    where
        I: WorkItem<P::Writer>,
    {
        let opened = match self.ensure_writer().await {
            Ok(()) => self.writer.as_mut(),
            Err(error) => {
                return Err(ApplyFailure {
                    error,
                    writer_corrupted: true,
                })
            }
        };
        let Some(writer) = opened else {
            return Err(ApplyFailure {
                error: Arc::new(anyhow::anyhow!("index writer unavailable")),
                writer_corrupted: true,
            });
        };
        let result = item.apply(writer).await;
        // A failed item may still have written partially.
        self.uncommitted = true;
        self.unrefreshed = true;
        if result.is_ok() {
            self.uncommitted_items += 1;
        }
        result.map_err(|e| {
            let writer_corrupted = is_writer_corruption(&e);
            ApplyFailure {
                error: Arc::new(e),
                writer_corrupted,
            }
        })
    }

    /// Commits now when no commit interval is configured or the interval has
    /// elapsed; otherwise returns how long the pending commit may still wait.
    pub async fn commit_or_delay(&mut self) -> Result<Option<Duration>, SharedError> {
        if !self.uncommitted {
            return Ok(None);
        }
        let elapsed = self.last_commit.elapsed();
        if self.commit_interval.is_zero() || elapsed >= self.commit_interval {
            self.commit().await?;
            return Ok(None);
        }
        Ok(Some(self.commit_interval - elapsed))
    }

    /// Refresh counterpart of [`Self::commit_or_delay`].
    pub async fn refresh_or_delay(&mut self) -> Result<Option<Duration>, SharedError> {
        if !self.unrefreshed {
            return Ok(None);
        }
        let elapsed = self.last_refresh.elapsed();
        if self.refresh_interval.is_zero() || elapsed >= self.refresh_interval {
            self.refresh().await?;
            return Ok(None);
        }
        Ok(Some(self.refresh_interval - elapsed))
    }

    pub async fn commit(&mut self) -> Result<(), SharedError> {
        let Some(writer) = self.writer.as_mut() else {
            self.uncommitted = false;
            return Ok(());
        };
        let started = Instant::now();
        writer.commit().await.map_err(Arc::new)?;
        self.uncommitted = false;
        self.uncommitted_items = 0;
        self.acknowledged_items = 0;
        self.last_commit = Instant::now();
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Committed index '{}' in {:?}",
            self.provider.index_name(),
            started.elapsed()
        );
        Ok(())
    }

    pub async fn refresh(&mut self) -> Result<(), SharedError> {
        let Some(writer) = self.writer.as_mut() else {
            self.unrefreshed = false;
            return Ok(());
        };
        writer.refresh().await.map_err(Arc::new)?;
        self.unrefreshed = false;
        self.last_refresh = Instant::now();
        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!("Refreshed index '{}'", self.provider.index_name());
        Ok(())
    }

    /// Discards the writer after `cause` and reports it. Never fails: a
    /// secondary error raised while discarding is attached to `cause`.
    pub async fn clean_up_after_failure(&mut self, cause: &SharedError, operation: &str) {
        let mut secondary = Vec::new();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.discard().await {
                warn!(
                    "Failed to discard index writer of '{}' after {} failure: {:#}",
                    self.provider.index_name(),
                    operation,
                    e
                );
                secondary.push(Arc::new(e));
            }
            self.stats.writer_discards.fetch_add(1, Ordering::Relaxed);
        }
        self.uncommitted = false;
        self.unrefreshed = false;
        let lost = std::mem::take(&mut self.acknowledged_items);
        self.uncommitted_items = 0;

        error!(
            "{} failed on index '{}', writer discarded: {:#}",
            operation,
            self.provider.index_name(),
            cause
        );
        self.failures.add_with_suppressed(
            format!("{operation} failed; index writer discarded"),
            cause.clone(),
            secondary,
        );
        if lost > 0 {
            warn!(
                "{} acknowledged change(s) on index '{}' were lost with the discarded writer",
                lost,
                self.provider.index_name()
            );
            self.failures.add_message(format!(
                "{lost} change(s) already reported as applied were never committed and were lost with the discarded index writer"
            ));
        }
    }

    /// Final commit and release of the writer.
    pub async fn close(&mut self) -> Result<(), SharedError> {
        if self.uncommitted {
            if let Err(e) = self.commit().await {
                self.clean_up_after_failure(&e, "final commit").await;
                return Err(e);
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.close().await.map_err(Arc::new)?;
            debug!("Closed index writer for '{}'", self.provider.index_name());
        }
        Ok(())
    }
}
