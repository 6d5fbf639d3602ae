//! Output capability used for query results and warnings.
//!
//! The core never formats to stdout directly. Everything human-readable goes
//! through an injected [`Logger`]; the default forwards to `tracing`.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Injected output sink.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);

    /// Opens an indented group; the default just logs the title.
    fn group(&self, title: &str) {
        self.log(title);
    }

    fn group_end(&self) {}
}

/// Forwards to `tracing` events, indenting grouped output.
#[derive(Debug, Default)]
pub struct TracingLogger {
    depth: AtomicUsize,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn indent(&self) -> String {
        "  ".repeat(self.depth.load(Ordering::Relaxed))
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::info!(target: "streamspy", "{}{}", self.indent(), message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "streamspy", "{}{}", self.indent(), message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "streamspy", "{}{}", self.indent(), message);
    }

    fn group(&self, title: &str) {
        self.log(title);
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    fn group_end(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }
}

/// Severity of a captured line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Warn,
    Error,
}

/// A line captured by [`MemoryLogger`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// Captures output in memory. Used by tests and by embedders that render
/// output themselves.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<LogLine>>,
    depth: AtomicUsize,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: LogLevel, message: &str) {
        let indent = "  ".repeat(self.depth.load(Ordering::Relaxed));
        self.lines.lock().push(LogLine {
            level,
            message: format!("{indent}{message}"),
        });
    }

    /// All captured lines, oldest first.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Captured messages at the given level.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.level == level)
            .map(|line| line.message.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages(LogLevel::Warn)
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.message.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Logger for MemoryLogger {
    fn log(&self, message: &str) {
        self.push(LogLevel::Log, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }

    fn group(&self, title: &str) {
        self.push(LogLevel::Log, title);
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    fn group_end(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }
}

/// Emits each distinct warning once.
#[derive(Debug, Default)]
pub(crate) struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    /// Logs `message` unless it was logged before. Returns true if logged.
    pub(crate) fn warn(&self, logger: &dyn Logger, message: &str) -> bool {
        if !self.seen.lock().insert(message.to_string()) {
            return false;
        }
        tracing::warn!(target: "streamspy", "{}", message);
        logger.warn(message);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_groups() {
        let logger = MemoryLogger::new();
        logger.group("Snapshot");
        logger.log("entry");
        logger.group_end();
        logger.log("after");

        let lines = logger.lines();
        assert_eq!(lines[0].message, "Snapshot");
        assert_eq!(lines[1].message, "  entry");
        assert_eq!(lines[2].message, "after");
    }

    #[test]
    fn test_warn_once() {
        let logger = MemoryLogger::new();
        let once = WarnOnce::default();

        assert!(once.warn(&logger, "Graph plugin not found"));
        assert!(!once.warn(&logger, "Graph plugin not found"));
        assert!(once.warn(&logger, "Snapshot plugin not found"));

        assert_eq!(logger.warnings().len(), 2);
    }
}
