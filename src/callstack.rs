//! Bounded stack of in-progress inter-module calls

use crate::diagnostics::fit_to_length;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::module::{Caller, ModuleId};
use std::fmt::Write as _;

/// Error attached to a frame whose call returned abnormally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One in-progress invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub caller: Caller,
    pub callee: ModuleId,
    pub function: String,
    pub error: Option<FrameError>,
}

impl CallFrame {
    pub fn new(caller: Caller, callee: ModuleId, function: impl Into<String>) -> Self {
        Self {
            caller,
            callee,
            function: function.into(),
            error: None,
        }
    }
}

/// Fixed-capacity call stack
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    max_depth: usize,
}

impl CallStack {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max_depth),
            max_depth,
        }
    }

    /// Push a frame
    ///
    /// # Errors
    /// `CallStackOverflow` when the stack is already at its maximum depth.
    pub fn push(&mut self, frame: CallFrame) -> Result<()> {
        if self.frames.len() >= self.max_depth {
            return Err(RuntimeError::CallStackOverflow {
                depth: self.frames.len(),
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn current(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Frames from outermost to innermost
    #[must_use]
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Whether `module` is being executed anywhere on the stack
    #[must_use]
    pub fn contains_callee(&self, module: ModuleId) -> bool {
        self.frames.iter().any(|frame| frame.callee == module)
    }

    /// Index of the innermost frame where `module` is the caller
    /// (`as_caller`) or the callee
    #[must_use]
    pub fn find_module(&self, module: ModuleId, as_caller: bool) -> Option<usize> {
        self.frames.iter().rposition(|frame| {
            if as_caller {
                frame.caller == Caller::Module(module)
            } else {
                frame.callee == module
            }
        })
    }

    /// Attach an error to the innermost frame
    pub fn annotate_current(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.error = Some(FrameError {
                kind,
                message: message.into(),
            });
        }
    }

    /// Render the stack, innermost frame first
    ///
    /// `name_of` maps module ids to display names. Output longer than
    /// `max_len` bytes ends with a truncation marker.
    pub fn format_trace<F>(&self, max_len: usize, with_errors: bool, name_of: F) -> String
    where
        F: Fn(ModuleId) -> String,
    {
        if self.frames.is_empty() {
            return fit_to_length("Call stack: <empty>\n".to_string(), max_len);
        }

        let mut out = format!("Call stack (depth {}):\n", self.frames.len());
        for (level, frame) in self.frames.iter().enumerate().rev() {
            let caller = match frame.caller {
                Caller::Host => "host".to_string(),
                Caller::Module(id) => name_of(id),
            };
            let _ = write!(
                out,
                "  {level}: {caller} -> {}::{}",
                name_of(frame.callee),
                frame.function
            );
            if with_errors {
                if let Some(err) = &frame.error {
                    let _ = write!(out, " [error {}: {}]", err.kind, err.message);
                }
            }
            out.push('\n');
        }
        fit_to_length(out, max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(caller: Caller, callee: u32, function: &str) -> CallFrame {
        CallFrame::new(caller, ModuleId(callee), function)
    }

    #[test]
    fn test_push_pop() {
        let mut stack = CallStack::new(4);
        stack.push(frame(Caller::Host, 1, "a")).unwrap();
        stack.push(frame(Caller::Module(ModuleId(1)), 2, "b")).unwrap();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().unwrap().function, "b");
        assert_eq!(stack.pop().unwrap().callee, ModuleId(2));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_overflow() {
        let mut stack = CallStack::new(1);
        stack.push(frame(Caller::Host, 1, "a")).unwrap();
        let err = stack.push(frame(Caller::Host, 2, "b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallStackOverflow);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_find_module() {
        let mut stack = CallStack::new(8);
        stack.push(frame(Caller::Host, 1, "a")).unwrap();
        stack.push(frame(Caller::Module(ModuleId(1)), 2, "b")).unwrap();
        assert!(stack.contains_callee(ModuleId(2)));
        assert_eq!(stack.find_module(ModuleId(1), true), Some(1));
        assert_eq!(stack.find_module(ModuleId(1), false), Some(0));
        assert_eq!(stack.find_module(ModuleId(3), false), None);
    }

    #[test]
    fn test_format_trace_with_errors() {
        let mut stack = CallStack::new(8);
        stack.push(frame(Caller::Host, 1, "run")).unwrap();
        stack.push(frame(Caller::Module(ModuleId(1)), 2, "rate")).unwrap();
        stack.annotate_current(ErrorKind::OperationFailed, "table missing");

        let names = |id: ModuleId| format!("mod{}", id.0);
        let plain = stack.format_trace(4096, false, names);
        assert!(plain.contains("1: mod1 -> mod2::rate"));
        assert!(plain.contains("0: host -> mod1::run"));
        assert!(!plain.contains("table missing"));

        let detailed = stack.format_trace(4096, true, names);
        assert!(detailed.contains("[error operation_failed: table missing]"));

        let cut = stack.format_trace(24, false, names);
        assert!(cut.ends_with(crate::diagnostics::TRUNCATION_MARKER));
    }
}
