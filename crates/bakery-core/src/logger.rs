//! Build log entries and sinks.
//!
//! Every executed instruction produces one or more [`LogEntry`] records,
//! written through the [`BuildLogger`] trait. [`MemoryLogger`] keeps them
//! in a ring buffer and optionally persists them as JSON Lines.
//!
//! Each entry is also mirrored to `tracing`, so the CLI's subscriber sees
//! the build as it happens.
//!
//! # Example
//!
//! ```
//! use bakery_core::logger::{BuildLogger, LogEntry, LogState, MemoryLogger};
//!
//! let mut log = MemoryLogger::new(100);
//! log.write(LogEntry::new(LogState::Success, "Copied a.txt"));
//! log.write(LogEntry::new(LogState::Error, "b.txt not found"));
//!
//! assert_eq!(log.count(LogState::Error), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{Command, SectionAddress};

/// Outcome class of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogState {
    Success,
    Warning,
    Error,
    Info,
    /// Skipped branch or no-op.
    Ignore,
    /// Error suppressed by `System,ErrorOff`.
    Muted,
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogState::Success => "Success",
            LogState::Warning => "Warning",
            LogState::Error => "Error",
            LogState::Info => "Info",
            LogState::Ignore => "Ignore",
            LogState::Muted => "Muted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub state: LogState,
    pub message: String,
    /// Source line of the command, when the entry belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SectionAddress>,
    /// Indentation level: section call depth plus command depth.
    pub depth: usize,
}

impl LogEntry {
    pub fn new(state: LogState, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            state,
            message: message.into(),
            origin: None,
            address: None,
            depth: 0,
        }
    }

    /// Entry attributed to `cmd`, indented at `depth`.
    pub fn for_command(state: LogState, message: impl Into<String>, cmd: &Command, depth: usize) -> Self {
        Self {
            origin: Some(cmd.origin.clone()),
            address: Some(cmd.address.clone()),
            depth,
            ..Self::new(state, message)
        }
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn is_error(&self) -> bool {
        self.state == LogState::Error
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:width$}[{}] {}", "", self.state, self.message, width = self.depth * 2)?;
        if let Some(origin) = &self.origin {
            write!(f, " ({origin})")?;
        }
        Ok(())
    }
}

/// Sink for build log entries.
pub trait BuildLogger {
    fn write(&mut self, entry: LogEntry);
}

/// Forwards an entry to `tracing` at a level matching its state.
pub fn trace_entry(entry: &LogEntry) {
    let origin = entry.origin.as_deref().unwrap_or("");
    match entry.state {
        LogState::Error => error!(origin, "{}", entry.message),
        LogState::Warning => warn!(origin, "{}", entry.message),
        LogState::Success | LogState::Info => info!(origin, "{}", entry.message),
        LogState::Ignore | LogState::Muted => debug!(origin, state = %entry.state, "{}", entry.message),
    }
}

/// Ring-buffered in-memory log with an optional JSON Lines file.
pub struct MemoryLogger {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    writer: Option<BufWriter<File>>,
}

impl fmt::Debug for MemoryLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLogger")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

impl Default for MemoryLogger {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LOG_CAPACITY)
    }
}

impl MemoryLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            writer: None,
        }
    }

    /// Also appends every entry to `path` as one JSON object per line.
    pub fn with_file(mut self, path: &Path) -> std::io::Result<Self> {
        self.writer = Some(BufWriter::new(File::create(path)?));
        Ok(self)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, state: LogState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    /// Messages of every entry with `state`, in order.
    pub fn messages(&self, state: LogState) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.message.as_str())
            .collect()
    }

    /// Indented text rendering of the whole log.
    pub fn render(&self) -> String {
        self.entries.iter().map(|e| format!("{e}\n")).collect()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl BuildLogger for MemoryLogger {
    fn write(&mut self, entry: LogEntry) {
        trace_entry(&entry);

        if let Some(writer) = self.writer.as_mut() {
            if let Ok(json) = serde_json::to_string(&entry) {
                if let Err(e) = writeln!(writer, "{json}") {
                    warn!(error = %e, "failed to write build log file");
                }
            }
        }

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

impl Drop for MemoryLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
