//! Error types shared by every runtime subsystem.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse classification of a [`RuntimeError`]
///
/// Diagnostics records store the kind rather than the full error so that
/// histories stay cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    InvalidArguments,
    NotInitialized,
    AlreadyInitialized,
    OutOfMemory,
    ModuleNotFound,
    ModuleLoadingFailed,
    InvalidManifest,
    DependencyNotFound,
    DependencyConflict,
    CircularDependency,
    CallStackOverflow,
    QueueOverflow,
    OperationFailed,
}

impl ErrorKind {
    /// Stable name used in formatted traces
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalid_arguments",
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::OutOfMemory => "out_of_memory",
            Self::ModuleNotFound => "module_not_found",
            Self::ModuleLoadingFailed => "module_loading_failed",
            Self::InvalidManifest => "invalid_manifest",
            Self::DependencyNotFound => "dependency_not_found",
            Self::DependencyConflict => "dependency_conflict",
            Self::CircularDependency => "circular_dependency",
            Self::CallStackOverflow => "call_stack_overflow",
            Self::QueueOverflow => "queue_overflow",
            Self::OperationFailed => "operation_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the module runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Module '{0}' is not initialized")]
    NotInitialized(String),

    #[error("Module '{0}' is already initialized")]
    AlreadyInitialized(String),

    #[error("Capacity exhausted: {0}")]
    OutOfMemory(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Failed to load module from {path}: {reason}")]
    ModuleLoadingFailed { path: String, reason: String },

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Required dependency not found: {0}")]
    DependencyNotFound(String),

    #[error("Dependency conflict: {0}")]
    DependencyConflict(String),

    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    #[error("Call stack overflow at depth {depth}")]
    CallStackOverflow { depth: usize },

    #[error("Merger event queue full ({capacity} events)")]
    QueueOverflow { capacity: usize },

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// The taxonomy entry this error belongs to
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::ModuleNotFound(_) => ErrorKind::ModuleNotFound,
            Self::ModuleLoadingFailed { .. } => ErrorKind::ModuleLoadingFailed,
            Self::InvalidManifest { .. } => ErrorKind::InvalidManifest,
            Self::DependencyNotFound(_) => ErrorKind::DependencyNotFound,
            Self::DependencyConflict(_) => ErrorKind::DependencyConflict,
            Self::CircularDependency(_) => ErrorKind::CircularDependency,
            Self::CallStackOverflow { .. } => ErrorKind::CallStackOverflow,
            Self::QueueOverflow { .. } => ErrorKind::QueueOverflow,
            Self::OperationFailed(_) | Self::Io(_) => ErrorKind::OperationFailed,
        }
    }

    pub(crate) fn load_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleLoadingFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_manifest(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RuntimeError::QueueOverflow { capacity: 4 }.kind(),
            ErrorKind::QueueOverflow
        );
        assert_eq!(
            RuntimeError::load_failed("libx.so", "missing").kind(),
            ErrorKind::ModuleLoadingFailed
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(RuntimeError::from(io).kind(), ErrorKind::OperationFailed);
    }

    #[test]
    fn test_error_messages() {
        let err = RuntimeError::CallStackOverflow { depth: 32 };
        assert_eq!(err.to_string(), "Call stack overflow at depth 32");
        assert_eq!(ErrorKind::CircularDependency.to_string(), "circular_dependency");
    }
}
