//! Per-module error history and diagnostic formatting
//!
//! Every module gets a bounded [`ErrorContext`] the first time it reports an
//! error. Histories outlive the call stack, so a failure can still be
//! inspected after the invocation that produced it has unwound.

use crate::error::ErrorKind;
use crate::module::ModuleId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Appended when formatted output is cut to fit a length limit
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Length limit of stack traces written to the debug log
pub(crate) const TRACE_LOG_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        })
    }
}

/// Where an error was raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// One recorded error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub timestamp: DateTime<Utc>,
    /// Call stack depth when the error was recorded
    pub call_depth: usize,
    /// Module that called into the reporting module, if any
    pub caller: Option<ModuleId>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            location: None,
            timestamp: Utc::now(),
            call_depth: 0,
            caller: None,
        }
    }

    #[must_use]
    pub fn at(mut self, file: &str, line: u32, function: &str) -> Self {
        self.location = Some(SourceLocation {
            file: file.to_string(),
            line,
            function: function.to_string(),
        });
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.severity,
            self.kind,
            self.message
        )?;
        if let Some(loc) = &self.location {
            write!(f, " ({}:{} in {})", loc.file, loc.line, loc.function)?;
        }
        if let Some(caller) = self.caller {
            write!(f, " [caller {caller}]")?;
        }
        Ok(())
    }
}

/// Bounded circular history of one module's errors
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    entries: VecDeque<ErrorInfo>,
    capacity: usize,
    total: usize,
    overflow: bool,
}

impl ErrorContext {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            overflow: false,
        }
    }

    /// Append an error, evicting the oldest once the buffer is full
    pub fn record(&mut self, info: ErrorInfo) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.overflow = true;
        }
        self.entries.push_back(info);
        self.total += 1;
    }

    /// Errors ever recorded, including evicted ones
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.total
    }

    /// Whether older errors have been evicted
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained errors, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &ErrorInfo> {
        self.entries.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&ErrorInfo> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
        self.overflow = false;
    }

    /// Render the retained history, newest last
    #[must_use]
    pub fn format(&self, module_label: &str, max_len: usize) -> String {
        let mut out = format!(
            "Error history for {module_label} ({} recorded, {} retained{}):\n",
            self.total,
            self.entries.len(),
            if self.overflow { ", oldest discarded" } else { "" }
        );
        for (idx, info) in self.entries.iter().enumerate() {
            out.push_str(&format!("  {idx}: {info}\n"));
        }
        fit_to_length(out, max_len)
    }
}

/// Lazily created error contexts for every module
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    contexts: HashMap<ModuleId, ErrorContext>,
    capacity: usize,
}

impl ErrorHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            capacity,
        }
    }

    pub fn record(&mut self, module: ModuleId, info: ErrorInfo) {
        let capacity = self.capacity;
        self.contexts
            .entry(module)
            .or_insert_with(|| ErrorContext::new(capacity))
            .record(info);
    }

    #[must_use]
    pub fn context(&self, module: ModuleId) -> Option<&ErrorContext> {
        self.contexts.get(&module)
    }

    /// Total errors recorded for `module`, zero if it never reported one
    #[must_use]
    pub fn error_count(&self, module: ModuleId) -> usize {
        self.contexts.get(&module).map_or(0, ErrorContext::error_count)
    }

    pub fn clear(&mut self, module: ModuleId) {
        if let Some(ctx) = self.contexts.get_mut(&module) {
            ctx.clear();
        }
    }

    pub(crate) fn remove(&mut self, module: ModuleId) -> Option<ErrorContext> {
        self.contexts.remove(&module)
    }
}

/// Cut `text` so that it fits in `max_len` bytes, ending with
/// [`TRUNCATION_MARKER`] when anything was dropped
#[must_use]
pub fn fit_to_length(mut text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    if max_len <= TRUNCATION_MARKER.len() {
        return TRUNCATION_MARKER[..max_len].to_string();
    }
    let mut cut = max_len - TRUNCATION_MARKER.len();
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

/// Record an error against a module with the current source location
///
/// ```ignore
/// record_error!(runtime, module, ErrorKind::OperationFailed, Severity::Error,
///               "cooling rate negative for galaxy {}", idx);
/// ```
#[macro_export]
macro_rules! record_error {
    ($runtime:expr, $module:expr, $kind:expr, $severity:expr, $($arg:tt)+) => {
        $runtime.record_error(
            $module,
            $crate::diagnostics::ErrorInfo::new($kind, $severity, format!($($arg)+))
                .at(file!(), line!(), module_path!()),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(message: &str) -> ErrorInfo {
        ErrorInfo::new(ErrorKind::OperationFailed, Severity::Error, message)
    }

    #[test]
    fn test_circular_buffer_keeps_most_recent() {
        let mut ctx = ErrorContext::new(2);
        ctx.record(info("first"));
        ctx.record(info("second"));
        ctx.record(info("third"));

        assert_eq!(ctx.error_count(), 3);
        assert!(ctx.overflowed());
        let messages: Vec<&str> = ctx.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "third"]);
        assert_eq!(ctx.latest().unwrap().message, "third");
    }

    #[test]
    fn test_history_is_lazy() {
        let mut history = ErrorHistory::new(4);
        let id = ModuleId(5);
        assert!(history.context(id).is_none());
        assert_eq!(history.error_count(id), 0);

        history.record(id, info("boom"));
        assert_eq!(history.error_count(id), 1);

        history.clear(id);
        assert_eq!(history.error_count(id), 0);
        assert!(!history.context(id).unwrap().overflowed());
    }

    #[test]
    fn test_error_info_display() {
        let e = info("cooling table missing").at("cooling.rs", 42, "load_tables");
        let text = e.to_string();
        assert!(text.contains("ERROR operation_failed: cooling table missing"));
        assert!(text.contains("cooling.rs:42 in load_tables"));
    }

    #[test]
    fn test_fit_to_length() {
        assert_eq!(fit_to_length("short".to_string(), 10), "short");
        let long = "x".repeat(100);
        let cut = fit_to_length(long, 30);
        assert_eq!(cut.len(), 30);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert_eq!(fit_to_length("abcdefghijkl".to_string(), 3), "...");
    }

    #[test]
    fn test_history_format_and_json() {
        let mut ctx = ErrorContext::new(2);
        ctx.record(info("a"));
        let text = ctx.format("cooling", 4096);
        assert!(text.starts_with("Error history for cooling (1 recorded, 1 retained)"));

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["entries"][0]["kind"], "OperationFailed");
    }
}
