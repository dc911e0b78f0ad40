//! Append-only metrics log of task lifecycle records.
//!
//! All tasks share one [`MetricsLog`]. It wraps the sink in a single mutex,
//! held only for one append, so concurrent completions never interleave
//! partial records.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::lifecycle::TaskRecord;

/// Destination of lifecycle records.
pub trait MetricsSink: Send {
    fn append(&mut self, record: &TaskRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Records held in memory, for sinks that keep them.
    fn recorded(&self) -> Option<Vec<TaskRecord>> {
        None
    }
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn append(&mut self, _record: &TaskRecord) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<TaskRecord>,
}

impl MetricsSink for MemorySink {
    fn append(&mut self, record: &TaskRecord) -> io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn recorded(&self) -> Option<Vec<TaskRecord>> {
        Some(self.records.clone())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<BufWriter<std::fs::File>> {
    /// Appends to `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> MetricsSink for JsonLinesSink<W> {
    fn append(&mut self, record: &TaskRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Shared handle to the process-wide sink.
#[derive(Clone)]
pub struct MetricsLog {
    sink: Arc<Mutex<Box<dyn MetricsSink>>>,
    appended: Arc<AtomicU64>,
}

impl fmt::Debug for MetricsLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsLog")
            .field("appended", &self.appended())
            .finish()
    }
}

impl Default for MetricsLog {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl MetricsLog {
    pub fn new(sink: impl MetricsSink + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            appended: Arc::new(AtomicU64::new(0)),
        }
    }

    /// In-memory log, handy for tests and operators' introspection.
    pub fn in_memory() -> Self {
        Self::new(MemorySink::default())
    }

    /// Appends one record. Sink errors are logged, never propagated.
    pub fn append(&self, record: &TaskRecord) {
        let result = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append(record);
        match result {
            Ok(()) => {
                self.appended.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(task_id = %record.task_id, error = %e, "Failed to append metrics record");
            }
        }
    }

    pub fn flush(&self) {
        if let Err(e) = self.sink.lock().unwrap_or_else(|e| e.into_inner()).flush() {
            warn!(error = %e, "Failed to flush metrics sink");
        }
    }

    /// Number of records successfully appended.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Records held by an in-memory sink; `None` for other sinks.
    pub fn recorded(&self) -> Option<Vec<TaskRecord>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).recorded()
    }
}
