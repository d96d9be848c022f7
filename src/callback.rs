//! Inter-module calls
//!
//! A module exposes named functions through its descriptor or through
//! [`Runtime::register_function`]; other modules reach them with
//! [`Runtime::invoke`]. Every call is tracked on the runtime's call stack,
//! which provides cycle rejection and error attribution.
//!
//! `invoke` reports only whether the call could be made. A callee that fails
//! logically records the failure in its own error history and returns a
//! status through [`CallResult`] or the shared context, so callers have to
//! check both.

use crate::callstack::CallFrame;
use crate::diagnostics::{ErrorInfo, Severity, TRACE_LOG_LIMIT};
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::module::{Caller, ModuleDependency, ModuleId, ModuleType, Phase};
use crate::pipeline::PipelineContext;
use crate::runtime::Runtime;
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

/// Everything a called function can touch
pub struct Invocation<'a> {
    pub runtime: &'a mut Runtime,
    /// The module whose function is running
    pub module_id: ModuleId,
    pub caller: Caller,
    /// The callee's own state, as returned by its `initialize`
    pub state: &'a mut dyn Any,
    pub context: &'a mut dyn Any,
    pub args: &'a mut dyn Any,
}

impl Invocation<'_> {
    /// Record an error against the running module
    pub fn record_error(&mut self, kind: ErrorKind, severity: Severity, message: impl Into<String>) {
        let module = self.module_id;
        self.runtime
            .record_error(module, ErrorInfo::new(kind, severity, message));
    }
}

/// Everything a phase handler can touch
pub struct PhaseCall<'a> {
    pub runtime: &'a mut Runtime,
    pub module_id: ModuleId,
    pub phase: Phase,
    pub state: &'a mut dyn Any,
    pub context: &'a mut PipelineContext,
}

/// Downcast an opaque value, reporting `InvalidArguments` on a type mismatch
pub fn downcast_mut<'a, T: Any>(value: &'a mut dyn Any, what: &str) -> Result<&'a mut T> {
    value.downcast_mut::<T>().ok_or_else(|| {
        RuntimeError::InvalidArguments(format!(
            "{what} is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Declared return kind of an exposed function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Int,
    Double,
    Opaque,
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Void => "void",
            Self::Int => "int",
            Self::Double => "double",
            Self::Opaque => "opaque",
        })
    }
}

type VoidFn = dyn Fn(&mut Invocation<'_>);
type IntFn = dyn Fn(&mut Invocation<'_>) -> i32;
type DoubleFn = dyn Fn(&mut Invocation<'_>) -> f64;
type OpaqueFn = dyn Fn(&mut Invocation<'_>) -> Option<Box<dyn Any>>;

/// A callable tagged with its return kind
#[derive(Clone)]
pub enum ModuleFunction {
    Void(Rc<VoidFn>),
    Int(Rc<IntFn>),
    Double(Rc<DoubleFn>),
    Opaque(Rc<OpaqueFn>),
}

impl ModuleFunction {
    pub fn void(f: impl Fn(&mut Invocation<'_>) + 'static) -> Self {
        Self::Void(Rc::new(f))
    }

    pub fn int(f: impl Fn(&mut Invocation<'_>) -> i32 + 'static) -> Self {
        Self::Int(Rc::new(f))
    }

    pub fn double(f: impl Fn(&mut Invocation<'_>) -> f64 + 'static) -> Self {
        Self::Double(Rc::new(f))
    }

    pub fn opaque(f: impl Fn(&mut Invocation<'_>) -> Option<Box<dyn Any>> + 'static) -> Self {
        Self::Opaque(Rc::new(f))
    }

    #[must_use]
    pub fn return_kind(&self) -> ReturnKind {
        match self {
            Self::Void(_) => ReturnKind::Void,
            Self::Int(_) => ReturnKind::Int,
            Self::Double(_) => ReturnKind::Double,
            Self::Opaque(_) => ReturnKind::Opaque,
        }
    }

    fn call(&self, invocation: &mut Invocation<'_>) -> CallResult {
        match self {
            Self::Void(f) => {
                f(invocation);
                CallResult::None
            }
            Self::Int(f) => CallResult::Int(f(invocation)),
            Self::Double(f) => CallResult::Double(f(invocation)),
            Self::Opaque(f) => CallResult::Opaque(f(invocation)),
        }
    }
}

/// One entry of a module's function table
#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub function: ModuleFunction,
    pub signature: Option<String>,
    pub description: Option<String>,
}

impl FunctionEntry {
    pub fn new(name: impl Into<String>, function: ModuleFunction) -> Self {
        Self {
            name: name.into(),
            function,
            signature: None,
            description: None,
        }
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn return_kind(&self) -> ReturnKind {
        self.function.return_kind()
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("return_kind", &self.return_kind())
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Value produced by a called function
pub enum CallResult {
    None,
    Int(i32),
    Double(f64),
    Opaque(Option<Box<dyn Any>>),
}

impl CallResult {
    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Take an opaque result as a concrete type
    #[must_use]
    pub fn into_opaque<T: Any>(self) -> Option<Box<T>> {
        match self {
            Self::Opaque(Some(value)) => value.downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Status convention of integer-returning functions: zero is success
    #[must_use]
    pub fn is_success_status(&self) -> bool {
        !matches!(self, Self::Int(code) if *code != 0)
    }
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Double(v) => write!(f, "Double({v})"),
            Self::Opaque(Some(_)) => f.write_str("Opaque(..)"),
            Self::Opaque(None) => f.write_str("Opaque(null)"),
        }
    }
}

impl Runtime {
    /// Add a function to a module's table
    ///
    /// # Errors
    /// `ModuleNotFound` for an unknown module, `InvalidArguments` for an
    /// empty or duplicate name, `OutOfMemory` when the table is full.
    pub fn register_function(&mut self, module: ModuleId, entry: FunctionEntry) -> Result<()> {
        self.registry.add_function(module, entry)
    }

    /// Declare that `module` depends on another module
    ///
    /// # Errors
    /// `ModuleNotFound` for an unknown module, `OutOfMemory` when the
    /// dependency list is full.
    pub fn declare_dependency(&mut self, module: ModuleId, dependency: ModuleDependency) -> Result<()> {
        self.registry.add_dependency(module, dependency)
    }

    /// Call `function` on the module named `target_name`, or on the active
    /// module of `target_type` when no name is given
    ///
    /// Module callers must have declared a dependency covering the target,
    /// and the target must not already be executing anywhere on the call
    /// stack. The returned value describes the call mechanics only; see the
    /// module documentation.
    ///
    /// # Errors
    /// `ModuleNotFound`, `NotInitialized`, `DependencyNotFound`,
    /// `DependencyConflict`, `CircularDependency`, `CallStackOverflow`, or
    /// `OperationFailed` when the target does not export `function`.
    pub fn invoke(
        &mut self,
        caller: Caller,
        target_type: ModuleType,
        target_name: Option<&str>,
        function: &str,
        context: &mut dyn Any,
        args: &mut dyn Any,
    ) -> Result<CallResult> {
        match self.prepare_call(caller, target_type, target_name, function) {
            Ok(target) => self.dispatch(caller, target, function, context, args),
            Err(err) => {
                warn!(
                    "Call from {} to {}::{} rejected: {}",
                    self.caller_label(caller),
                    target_name.unwrap_or(target_type.as_str()),
                    function,
                    err
                );
                if let Some(id) = caller.module_id() {
                    self.record_error(id, ErrorInfo::new(err.kind(), Severity::Error, err.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Resolve the callee and run every pre-call check
    fn prepare_call(
        &self,
        caller: Caller,
        target_type: ModuleType,
        target_name: Option<&str>,
        function: &str,
    ) -> Result<ModuleId> {
        if function.is_empty() {
            return Err(RuntimeError::InvalidArguments(
                "function name must not be empty".to_string(),
            ));
        }

        let target = self.registry.resolve(target_type, target_name)?;
        let target_entry = self.registry.get(target)?;

        if let Caller::Module(caller_id) = caller {
            let caller_entry = self.registry.get(caller_id)?;
            let dependency = caller_entry
                .dependencies()
                .iter()
                .find(|dep| dep.covers(target_entry.name(), target_entry.module_type()))
                .ok_or_else(|| {
                    RuntimeError::DependencyNotFound(format!(
                        "'{}' has no declared dependency on '{}' ({})",
                        caller_entry.name(),
                        target_entry.name(),
                        target_entry.module_type()
                    ))
                })?;

            if !dependency.range.satisfies(&target_entry.version()) {
                return Err(RuntimeError::DependencyConflict(format!(
                    "'{}' requires {} {}, found {}",
                    caller_entry.name(),
                    dependency.target_label(),
                    dependency.range,
                    target_entry.version()
                )));
            }
        }

        if self.call_stack.contains_callee(target) {
            return Err(RuntimeError::CircularDependency(format!(
                "'{}' is already executing ({} -> {}::{})",
                target_entry.name(),
                self.caller_label(caller),
                target_entry.name(),
                function
            )));
        }

        if !target_entry.is_initialized() {
            return Err(RuntimeError::NotInitialized(target_entry.name().to_string()));
        }

        Ok(target)
    }

    fn dispatch(
        &mut self,
        caller: Caller,
        target: ModuleId,
        function: &str,
        context: &mut dyn Any,
        args: &mut dyn Any,
    ) -> Result<CallResult> {
        self.call_stack
            .push(CallFrame::new(caller, target, function))?;

        let (entry, state) = {
            let target_entry = self.registry.get(target)?;
            (
                target_entry.function(function).cloned(),
                target_entry.state_handle(),
            )
        };

        let (Some(entry), Some(state)) = (entry, state) else {
            let err = RuntimeError::OperationFailed(format!(
                "module '{}' does not export function '{function}'",
                self.registry.name_of(target)
            ));
            self.call_stack
                .annotate_current(err.kind(), err.to_string());
            debug!("{}", self.format_stack_trace_with_errors(TRACE_LOG_LIMIT));
            self.call_stack.pop();
            if let Some(id) = caller.module_id() {
                self.record_error(id, ErrorInfo::new(err.kind(), Severity::Error, err.to_string()));
            }
            return Err(err);
        };

        let errors_before = self.errors.error_count(target);
        let result = {
            let mut guard = state.borrow_mut();
            let mut invocation = Invocation {
                runtime: self,
                module_id: target,
                caller,
                state: guard.as_mut(),
                context,
                args,
            };
            entry.function.call(&mut invocation)
        };

        if self.errors.error_count(target) > errors_before {
            if let Some(latest) = self.errors.context(target).and_then(|ctx| ctx.latest()) {
                self.call_stack
                    .annotate_current(latest.kind, latest.message.clone());
                debug!("{}", self.format_stack_trace_with_errors(TRACE_LOG_LIMIT));
            }
        }

        self.call_stack.pop();
        Ok(result)
    }

    /// Number of in-progress inter-module calls
    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.call_stack.depth()
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.call_stack.current()
    }

    /// Innermost stack level at which `module` appears as caller or callee
    #[must_use]
    pub fn find_module_in_stack(&self, module: ModuleId, as_caller: bool) -> Option<usize> {
        self.call_stack.find_module(module, as_caller)
    }

    #[must_use]
    pub fn format_stack_trace(&self, max_len: usize) -> String {
        self.call_stack
            .format_trace(max_len, false, |id| self.registry.name_of(id))
    }

    #[must_use]
    pub fn format_stack_trace_with_errors(&self, max_len: usize) -> String {
        self.call_stack
            .format_trace(max_len, true, |id| self.registry.name_of(id))
    }

    fn caller_label(&self, caller: Caller) -> String {
        match caller {
            Caller::Host => "host".to_string(),
            Caller::Module(id) => self.registry.name_of(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_kinds() {
        assert_eq!(ModuleFunction::void(|_| {}).return_kind(), ReturnKind::Void);
        assert_eq!(ModuleFunction::int(|_| 0).return_kind(), ReturnKind::Int);
        assert_eq!(ModuleFunction::double(|_| 1.0).return_kind(), ReturnKind::Double);
        assert_eq!(ModuleFunction::opaque(|_| None).return_kind(), ReturnKind::Opaque);
    }

    #[test]
    fn test_call_result_accessors() {
        assert_eq!(CallResult::Int(3).as_int(), Some(3));
        assert_eq!(CallResult::Double(2.5).as_double(), Some(2.5));
        assert!(CallResult::None.as_int().is_none());
        assert!(!CallResult::Int(-1).is_success_status());
        assert!(CallResult::Double(0.0).is_success_status());

        let boxed = CallResult::Opaque(Some(Box::new(7_u64)));
        assert_eq!(*boxed.into_opaque::<u64>().unwrap(), 7);
    }

    #[test]
    fn test_downcast_mut_reports_type() {
        let mut value: Box<dyn Any> = Box::new(1_i32);
        assert_eq!(*downcast_mut::<i32>(value.as_mut(), "args").unwrap(), 1);
        let err = downcast_mut::<String>(value.as_mut(), "args").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_function_entry_builder() {
        let entry = FunctionEntry::new("rate", ModuleFunction::double(|_| 0.5))
            .with_signature("double rate(Galaxy*)")
            .with_description("cooling rate");
        assert_eq!(entry.return_kind(), ReturnKind::Double);
        assert_eq!(entry.signature.as_deref(), Some("double rate(Galaxy*)"));
    }
}
