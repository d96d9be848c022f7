//! Galaxy Runtime - module runtime for semi-analytic galaxy simulations
//!
//! This library lets independently built physics modules be discovered,
//! version-checked, sequenced into a phased pipeline and called from one
//! another.
//!
//! # Modules
//!
//! - [`registry`]: Module registry, manifests and dynamic loading
//! - [`pipeline`]: Phased pipeline engine and its execution context
//! - [`callback`]: Inter-module calls with dependency and cycle checks
//! - [`callstack`]: Bounded call stack and trace formatting
//! - [`merger`]: Deferred merger event queue
//! - [`diagnostics`]: Per-module error histories
//! - [`runtime`]: The [`Runtime`] value tying everything together
//! - [`config`]: Configuration store and runtime limits
//! - [`modules`]: Built-in modules

pub mod callback;
pub mod callstack;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod merger;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod version;

pub use error::{ErrorKind, Result, RuntimeError};
pub use runtime::Runtime;
