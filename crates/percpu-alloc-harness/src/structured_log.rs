//! JSONL records for everything the allocator logs.
//!
//! [`JsonlLogger`] implements [`log::Log`] and writes one [`LogEntry`] per
//! line to its sink (stderr for the CLI, a buffer in tests).

use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Self::Trace,
            log::Level::Debug => Self::Debug,
            log::Level::Info => Self::Info,
            log::Level::Warn => Self::Warn,
            log::Level::Error => Self::Error,
        }
    }
}

/// One JSONL log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Per-logger sequence number, starting at 1.
    pub seq: u64,
    pub level: LogLevel,
    /// Module path of the call site.
    pub target: String,
    pub message: String,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A [`log::Log`] that writes [`LogEntry`] lines.
pub struct JsonlLogger<W> {
    sink: Mutex<W>,
    max_level: log::LevelFilter,
    seq: AtomicU64,
}

impl<W: Write + Send> JsonlLogger<W> {
    #[must_use]
    pub fn new(sink: W, max_level: log::LevelFilter) -> Self {
        Self {
            sink: Mutex::new(sink),
            max_level,
            seq: AtomicU64::new(0),
        }
    }

    /// Builds the entry `record` would produce.
    pub fn entry(&self, record: &log::Record<'_>) -> LogEntry {
        LogEntry {
            timestamp_ms: now_ms(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            level: record.level().into(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        }
    }

    /// Hands the sink back.
    pub fn into_inner(self) -> W {
        self.sink
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl JsonlLogger<std::io::Stderr> {
    /// Installs a stderr logger as the global `log` backend.
    pub fn install(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_boxed_logger(Box::new(Self::new(std::io::stderr(), max_level)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl<W: Write + Send> log::Log for JsonlLogger<W> {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = self.entry(record);
        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };
        let mut sink = self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = writeln!(sink, "{line}");
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}
