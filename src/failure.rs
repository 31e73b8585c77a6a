//! Hierarchical failure collection.
//!
//! A [`RootFailureCollector`] is created for one logical unit of work that may
//! fail in several places (a mass reindex, a batch flush, an orchestrator's
//! lifetime). Producers obtain a [`ContextualFailureCollector`] through
//! [`RootFailureCollector::with_context`] and record failures from any thread
//! without synchronizing themselves.
//!
//! Lock discipline: children are stored in a `DashMap`, each child guards only
//! its own entry list, and no code path ever holds a child's entry lock while
//! touching a map. Rendering first clones the child `Arc`s out of the map, then
//! locks each child's entries one at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::{FailureReport, SharedError};

/// Default maximum number of failures retained with full detail.
pub const DEFAULT_FAILURE_LIMIT: usize = 100;

/// Tracing target used for every recorded failure, including elided ones.
pub const FAILURE_LOG_TARGET: &str = "index_orchestrator::failure";

const INDENT: &str = "    ";

/// What a failure relates to. Equal contexts share one collector node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventContext {
    Index(String),
    Document(String),
    Operation(String),
    Custom(String),
}

impl EventContext {
    pub fn index(name: impl Into<String>) -> Self {
        Self::Index(name.into())
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self::Document(id.into())
    }

    pub fn operation(description: impl Into<String>) -> Self {
        Self::Operation(description.into())
    }

    pub fn custom(label: impl Into<String>) -> Self {
        Self::Custom(label.into())
    }
}

impl fmt::Display for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventContext::Index(name) => write!(f, "index '{name}'"),
            EventContext::Document(id) => write!(f, "document '{id}'"),
            EventContext::Operation(desc) => write!(f, "operation '{desc}'"),
            EventContext::Custom(label) => write!(f, "{label}"),
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone)]
pub struct FailureEntry {
    pub message: Option<String>,
    pub cause: Option<SharedError>,
    /// Secondary failures attached to `cause`, e.g. errors raised while
    /// cleaning up after it.
    pub suppressed: Vec<SharedError>,
    sequence: u64,
}

impl FailureEntry {
    fn render(&self) -> String {
        let mut line = match (&self.message, &self.cause) {
            (Some(message), Some(cause)) => format!("{message}: {cause:#}"),
            (Some(message), None) => message.clone(),
            (None, Some(cause)) => format!("{cause:#}"),
            (None, None) => "unknown failure".to_string(),
        };
        for secondary in &self.suppressed {
            line.push_str(&format!(" [suppressed: {secondary:#}]"));
        }
        line
    }
}

struct RootState {
    name: String,
    limit: usize,
    recorded: AtomicUsize,
    sequence: AtomicU64,
    children: DashMap<EventContext, Arc<ContextualFailureCollector>>,
}

impl RootState {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Root of a failure collector tree.
#[derive(Clone)]
pub struct RootFailureCollector {
    state: Arc<RootState>,
}

impl RootFailureCollector {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limit(name, DEFAULT_FAILURE_LIMIT)
    }

    pub fn with_limit(name: impl Into<String>, limit: usize) -> Self {
        Self {
            state: Arc::new(RootState {
                name: name.into(),
                limit,
                recorded: AtomicUsize::new(0),
                sequence: AtomicU64::new(0),
                children: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn limit(&self) -> usize {
        self.state.limit
    }

    /// Child collector for `context`; repeated calls with an equal context
    /// return the same instance.
    pub fn with_context(&self, context: EventContext) -> Arc<ContextualFailureCollector> {
        child_for(&self.state, &self.state.children, Vec::new(), context)
    }

    pub fn has_failure(&self) -> bool {
        self.failure_count() > 0
    }

    /// Total failures recorded, including those beyond the limit.
    pub fn failure_count(&self) -> usize {
        self.state.recorded.load(Ordering::SeqCst)
    }

    /// Returns normally when nothing was recorded, otherwise one aggregate
    /// report. Does not consume the collector: calling it again without new
    /// failures yields an equivalent outcome.
    pub fn check_no_failure(&self) -> std::result::Result<(), FailureReport> {
        let total = self.failure_count();
        if total == 0 {
            return Ok(());
        }

        let mut retained: Vec<(u64, SharedError)> = Vec::new();
        let mut body = String::new();
        for child in snapshot_children(&self.state.children) {
            child.render_into(&mut body, 1, &mut retained);
        }
        retained.sort_by_key(|(sequence, _)| *sequence);

        let displayed = total.min(self.state.limit);
        let elided = total - displayed;

        let mut message = format!(
            "Failures recorded by '{}': {} failure(s).\n",
            self.state.name, total
        );
        message.push_str(&body);
        if elided > 0 {
            message.push_str(&format!(
                "{elided} more failure(s) were elided: only the first {} of {total} are displayed here. \
                 See the TRACE logs of target '{FAILURE_LOG_TARGET}' for the remaining failures.",
                self.state.limit
            ));
        }

        debug!(
            "Failure collector '{}' reporting {} failure(s) ({} elided)",
            self.state.name, total, elided
        );

        Err(FailureReport {
            message: message.trim_end().to_string(),
            suppressed: retained.into_iter().map(|(_, error)| error).collect(),
            total,
            elided,
        })
    }
}

impl fmt::Debug for RootFailureCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootFailureCollector")
            .field("name", &self.state.name)
            .field("limit", &self.state.limit)
            .field("recorded", &self.failure_count())
            .finish()
    }
}

/// A node of the tree, bound to the path of contexts leading to it.
pub struct ContextualFailureCollector {
    root: Arc<RootState>,
    path: Vec<EventContext>,
    created: u64,
    failures: Mutex<Vec<FailureEntry>>,
    children: DashMap<EventContext, Arc<ContextualFailureCollector>>,
}

impl ContextualFailureCollector {
    pub fn with_context(&self, context: EventContext) -> Arc<ContextualFailureCollector> {
        child_for(&self.root, &self.children, self.path.clone(), context)
    }

    /// Human-readable path, e.g. `index 'books', document 'doc-1'`.
    pub fn context_path(&self) -> String {
        self.path
            .iter()
            .map(|context| context.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn add(&self, error: SharedError) {
        self.record(None, Some(error), Vec::new());
    }

    pub fn add_message(&self, message: impl Into<String>) {
        self.record(Some(message.into()), None, Vec::new());
    }

    pub fn add_with_message(&self, message: impl Into<String>, error: SharedError) {
        self.record(Some(message.into()), Some(error), Vec::new());
    }

    /// Records `error` with secondary failures attached to it.
    pub fn add_with_suppressed(
        &self,
        message: impl Into<String>,
        error: SharedError,
        suppressed: Vec<SharedError>,
    ) {
        self.record(Some(message.into()), Some(error), suppressed);
    }

    /// Whether this node retained at least one failure.
    pub fn has_failure(&self) -> bool {
        !self.entries().is_empty()
    }

    /// Failures retained by this node (children excluded).
    pub fn failure_count(&self) -> usize {
        self.entries().len()
    }

    fn record(&self, message: Option<String>, cause: Option<SharedError>, suppressed: Vec<SharedError>) {
        let entry = FailureEntry {
            message,
            cause,
            suppressed,
            sequence: self.root.next_sequence(),
        };
        let index = self.root.recorded.fetch_add(1, Ordering::SeqCst);

        trace!(
            target: FAILURE_LOG_TARGET,
            collector = %self.root.name,
            context = %self.context_path(),
            failure_number = index + 1,
            "{}",
            entry.render()
        );

        if index < self.root.limit {
            self.entries().push(entry);
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<FailureEntry>> {
        // A poisoned list still holds valid entries.
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render_into(&self, out: &mut String, depth: usize, retained: &mut Vec<(u64, SharedError)>) {
        let entries: Vec<FailureEntry> = self.entries().clone();
        let children = snapshot_children(&self.children);
        if entries.is_empty() && children.iter().all(|child| !child.has_any_failure()) {
            return;
        }

        let indent = INDENT.repeat(depth);
        if let Some(last) = self.path.last() {
            out.push_str(&format!("{indent}{last}:\n"));
        }

        if !entries.is_empty() {
            out.push_str(&format!("{indent}{INDENT}failures:\n"));
            for entry in &entries {
                out.push_str(&format!("{indent}{INDENT}  - {}\n", entry.render()));
                if let Some(cause) = &entry.cause {
                    retained.push((entry.sequence, cause.clone()));
                }
            }
        }

        for child in children {
            child.render_into(out, depth + 1, retained);
        }
    }

    fn has_any_failure(&self) -> bool {
        self.has_failure()
            || snapshot_children(&self.children)
                .iter()
                .any(|child| child.has_any_failure())
    }
}

impl fmt::Debug for ContextualFailureCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextualFailureCollector")
            .field("root", &self.root.name)
            .field("path", &self.context_path())
            .field("failures", &self.failure_count())
            .finish()
    }
}

fn child_for(
    root: &Arc<RootState>,
    children: &DashMap<EventContext, Arc<ContextualFailureCollector>>,
    mut path: Vec<EventContext>,
    context: EventContext,
) -> Arc<ContextualFailureCollector> {
    if let Some(existing) = children.get(&context) {
        return existing.value().clone();
    }
    children
        .entry(context.clone())
        .or_insert_with(|| {
            path.push(context);
            Arc::new(ContextualFailureCollector {
                root: root.clone(),
                path,
                created: root.next_sequence(),
                failures: Mutex::new(Vec::new()),
                children: DashMap::new(),
            })
        })
        .value()
        .clone()
}

/// Clones the children out of the map so no shard lock is held while they are
/// inspected. Ordered by creation.
fn snapshot_children(
    children: &DashMap<EventContext, Arc<ContextualFailureCollector>>,
) -> Vec<Arc<ContextualFailureCollector>> {
    let mut snapshot: Vec<_> = children.iter().map(|entry| entry.value().clone()).collect();
    snapshot.sort_by_key(|child| child.created);
    snapshot
}
