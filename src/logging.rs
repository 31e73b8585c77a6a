//! Tracing setup and an in-memory ring of recent log entries.
//!
//! Failure reports that elide entries point at the TRACE logs of
//! [`crate::failure::FAILURE_LOG_TARGET`]; with [`init_tracing`] installed those
//! entries can be read back from the returned [`LogBuffer`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::EnvFilter;

use crate::failure::FAILURE_LOG_TARGET;

// Overridable with INDEX_ORCHESTRATOR_LOG_BUFFER_CAPACITY.
const DEFAULT_LOG_CAPACITY: usize = 10_000;

const MAX_LOG_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

/// Thread-safe circular buffer for storing log entries
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    sequence_counter: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let capacity = std::env::var("INDEX_ORCHESTRATOR_LOG_BUFFER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Appends `entry`, evicting the oldest ones beyond capacity.
    pub fn push(&self, mut entry: LogEntry) {
        entry.sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&VecDeque<LogEntry>) -> T) -> T {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&entries)
    }

    /// Get the last N log entries, up to the buffer size
    pub fn get_last(&self, count: usize) -> Vec<LogEntry> {
        self.read(|entries| {
            let skip = entries.len().saturating_sub(count);
            entries.iter().skip(skip).cloned().collect()
        })
    }

    pub fn get_all(&self) -> Vec<LogEntry> {
        self.read(|entries| entries.iter().cloned().collect())
    }

    /// Entries logged under `target`, oldest first.
    pub fn get_by_target(&self, target: &str) -> Vec<LogEntry> {
        self.read(|entries| {
            entries
                .iter()
                .filter(|entry| entry.target == target)
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.read(VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracing layer that writes log entries to an in-memory buffer
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn format_message(event: &Event<'_>) -> String {
        struct MessageVisitor {
            message: String,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{value:?}");
                    if self.message.starts_with('"') && self.message.ends_with('"') {
                        self.message = self.message[1..self.message.len() - 1].to_string();
                    }
                }
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = value.to_string();
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            event.metadata().target().to_string()
        } else {
            visitor.message
        };

        if message.len() > MAX_LOG_MESSAGE_SIZE {
            let mut end = MAX_LOG_MESSAGE_SIZE;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... [TRUNCATED - original size: {} chars]",
                &message[..end],
                message.len()
            )
        } else {
            message
        }
    }
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S%.3f UTC")
            .to_string();

        self.buffer.push(LogEntry {
            sequence: 0, // Set by LogBuffer::push
            timestamp,
            level: metadata.level().into(),
            target: metadata.target().to_string(),
            message: Self::format_message(event),
        });
    }
}

/// Builds the filter from `directives` (`RUST_LOG` syntax, default `info`).
///
/// Failure records stay enabled at TRACE unless the directives name
/// [`FAILURE_LOG_TARGET`] themselves.
fn tracing_filter(directives: Option<&str>) -> EnvFilter {
    let directives = directives
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or("info");
    if directives.contains(FAILURE_LOG_TARGET) {
        EnvFilter::new(directives)
    } else {
        EnvFilter::new(format!("{directives},{FAILURE_LOG_TARGET}=trace"))
    }
}

/// Installs the global subscriber: an `EnvFilter` from `RUST_LOG` (default
/// `info`, failure records at TRACE), the memory layer and, when
/// `INDEX_ORCHESTRATOR_LOG_LEVEL` is `debug` or `trace`, a stderr formatter.
/// Returns the buffer fed by the memory layer.
///
/// When a global subscriber already exists the buffer stays empty.
pub fn init_tracing() -> LogBuffer {
    let log_buffer = LogBuffer::new();
    let memory_layer = MemoryLogLayer::new(log_buffer.clone());

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = tracing_filter(rust_log.as_deref());
    let subscriber = tracing_subscriber::registry()
        .with(memory_layer)
        .with(filter);

    let log_level = std::env::var("INDEX_ORCHESTRATOR_LOG_LEVEL").unwrap_or_default();
    if log_level == "debug" || log_level == "trace" {
        use tracing_subscriber::fmt;

        let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
        if tracing::subscriber::set_global_default(subscriber.with(fmt_layer)).is_ok() {
            tracing::info!("Tracing initialized with memory and stderr logging");
        }
    } else if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!("Tracing initialized with memory logging layer");
    }

    log_buffer
}
