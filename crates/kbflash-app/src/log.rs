/// Rolling status log shown to the user.
///
/// Every state transition and operation outcome appends one line. The log
/// is bounded; the oldest entries are evicted first. Each entry is also
/// mirrored to `tracing` so `-v` output and the status log agree.
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;

/// Maximum entries kept before the oldest are evicted.
pub const MAX_LOG_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "OK",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.tag(),
            self.message
        )
    }
}

#[derive(Debug, Default)]
pub struct StatusLog {
    entries: VecDeque<LogEntry>,
    /// Entries ever pushed, including evicted ones.
    pushed: u64,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!("{message}"),
            LogLevel::Warning | LogLevel::Error => tracing::warn!("{message}"),
        }

        if self.entries.len() == MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message,
        });
        self.pushed += 1;
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Success, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Running count of pushes, usable as a cursor for [`StatusLog::since`].
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Entries pushed after the cursor `seen`, skipping any already evicted.
    pub fn since(&self, seen: u64) -> impl Iterator<Item = &LogEntry> {
        let fresh = self.pushed.saturating_sub(seen).min(self.entries.len() as u64) as usize;
        self.entries.iter().skip(self.entries.len() - fresh)
    }
}
