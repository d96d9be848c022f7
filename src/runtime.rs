//! The runtime value
//!
//! [`Runtime`] owns every subsystem: the module registry, the call stack,
//! per-module error histories and the merger event queue. Independent
//! runtimes share nothing, so each test or simulation unit can build its
//! own.

use crate::callstack::CallStack;
use crate::config::{module_search_paths, ConfigStore, RuntimeLimits, ValueStore};
use crate::diagnostics::{ErrorContext, ErrorHistory, ErrorInfo, Severity};
use crate::error::{Result, RuntimeError};
use crate::merger::{MergerEventQueue, MergerHandlers};
use crate::module::{ModuleDescriptor, ModuleId, Phase};
use crate::modules::{handler_dependency, merger_queue_descriptor, MERGER_QUEUE_MODULE};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::registry::{ModuleSource, Registry};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

pub struct Runtime {
    pub(crate) registry: Registry,
    pub(crate) call_stack: CallStack,
    pub(crate) errors: ErrorHistory,
    pub(crate) merger_queue: MergerEventQueue,
    pub(crate) merger_handlers: MergerHandlers,
    limits: RuntimeLimits,
    config: Rc<dyn ConfigStore>,
}

impl Runtime {
    /// Runtime with an empty configuration
    #[must_use]
    pub fn new(limits: RuntimeLimits) -> Self {
        Self::build(limits, MergerHandlers::default(), Rc::new(ValueStore::empty()))
    }

    /// Runtime whose limits and merger handlers come from `config`
    #[must_use]
    pub fn with_config(config: Rc<dyn ConfigStore>) -> Self {
        let limits = RuntimeLimits::from_store(config.as_ref());
        let handlers = MergerHandlers::from_store(config.as_ref());
        Self::build(limits, handlers, config)
    }

    fn build(limits: RuntimeLimits, merger_handlers: MergerHandlers, config: Rc<dyn ConfigStore>) -> Self {
        debug!("Creating runtime with {:?}", limits);
        Self {
            registry: Registry::new(limits),
            call_stack: CallStack::new(limits.max_call_depth),
            errors: ErrorHistory::new(limits.error_history_capacity),
            merger_queue: MergerEventQueue::new(limits.merger_queue_capacity),
            merger_handlers,
            limits,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &dyn ConfigStore {
        self.config.as_ref()
    }

    /// Shared handle, e.g. for a [`PipelineContext`]'s parameters
    #[must_use]
    pub fn config_handle(&self) -> Rc<dyn ConfigStore> {
        Rc::clone(&self.config)
    }

    #[must_use]
    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// # Errors
    /// See [`Registry::register`].
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<ModuleId> {
        self.registry.register(descriptor)
    }

    /// Initialize a module with the runtime's configuration
    ///
    /// # Errors
    /// See [`Registry::initialize`].
    pub fn initialize_module(&mut self, id: ModuleId) -> Result<()> {
        self.registry.initialize(id, self.config.as_ref())
    }

    /// # Errors
    /// See [`Registry::configure`].
    pub fn configure_module(&mut self, id: ModuleId, key: &str, value: &str) -> Result<()> {
        self.registry.configure(id, key, value)
    }

    /// # Errors
    /// See [`Registry::set_active`].
    pub fn set_active(&mut self, id: ModuleId) -> Result<()> {
        self.registry.set_active(id)
    }

    /// # Errors
    /// `ModuleNotFound` for an unknown id.
    pub fn deactivate(&mut self, id: ModuleId) -> Result<()> {
        self.registry.deactivate(id)
    }

    /// Remove a module and its error history
    ///
    /// # Errors
    /// `OperationFailed` while the module is on the call stack, otherwise
    /// see [`Registry::unregister`].
    pub fn unregister(&mut self, id: ModuleId) -> Result<()> {
        if self.call_stack.find_module(id, false).is_some()
            || self.call_stack.find_module(id, true).is_some()
        {
            return Err(RuntimeError::OperationFailed(format!(
                "module '{}' is part of an in-progress call",
                self.registry.name_of(id)
            )));
        }
        self.registry.unregister(id)?;
        self.errors.remove(id);
        Ok(())
    }

    /// Register everything `source` provides
    ///
    /// # Errors
    /// Only when the source as a whole fails.
    pub fn load_from(&mut self, source: &mut dyn ModuleSource) -> Result<Vec<ModuleId>> {
        self.registry.load_from(source, self.config.as_ref())
    }

    /// Load dynamic modules from `search_paths`
    pub fn discover<P: AsRef<Path>>(&mut self, search_paths: &[P]) -> usize {
        self.registry.discover(search_paths, self.config.as_ref())
    }

    /// Load dynamic modules from the configured search paths
    pub fn discover_configured(&mut self) -> usize {
        let paths = module_search_paths(self.config.as_ref());
        self.discover(&paths)
    }

    /// Initialize and activate every enabled entry of `modules.instances`
    ///
    /// Returns the number of modules activated. Entries naming unknown
    /// modules or failing activation are logged and skipped.
    pub fn activate_from_config(&mut self) -> usize {
        let config = Rc::clone(&self.config);
        let path = "modules.instances";
        let mut activated = 0;

        for idx in 0..config.get_array_size(path) {
            let Some(instance) = config.get_array_element(path, idx) else {
                continue;
            };
            let name = instance.get_string("name", "");
            if name.is_empty() {
                warn!("{}.{} has no module name", path, idx);
                continue;
            }
            if !instance.get_bool("enabled", true) {
                debug!("Module instance '{}' disabled in configuration", name);
                continue;
            }
            let Some(id) = self.registry.find_by_name(&name) else {
                warn!("Configured module '{}' is not registered", name);
                continue;
            };

            match self.activate_instance(id) {
                Ok(()) => activated += 1,
                Err(e) => warn!("Failed to activate configured module '{}': {}", name, e),
            }
        }
        activated
    }

    fn activate_instance(&mut self, id: ModuleId) -> Result<()> {
        if !self.registry.get(id)?.is_initialized() {
            self.initialize_module(id)?;
        }
        self.set_active(id)
    }

    /// Register and initialize the merger queue processor
    ///
    /// Its dependencies are taken from the current merger handlers, so set
    /// those first. Calling this again returns the existing module.
    ///
    /// # Errors
    /// Registration or initialization failure.
    pub fn install_merger_queue_module(&mut self) -> Result<ModuleId> {
        if let Some(id) = self.registry.find_by_name(MERGER_QUEUE_MODULE) {
            return Ok(id);
        }
        let id = self.register(merger_queue_descriptor(&self.merger_handlers))?;
        self.initialize_module(id)?;
        Ok(id)
    }

    #[must_use]
    pub fn merger_queue(&self) -> &MergerEventQueue {
        &self.merger_queue
    }

    pub fn merger_queue_mut(&mut self) -> &mut MergerEventQueue {
        &mut self.merger_queue
    }

    #[must_use]
    pub fn merger_handlers(&self) -> &MergerHandlers {
        &self.merger_handlers
    }

    /// Replace the merger handlers
    ///
    /// An installed merger queue module gains a dependency on each new
    /// target so later drains may call it.
    ///
    /// # Errors
    /// `OutOfMemory` when the module's dependency list is full; the
    /// handlers are left unchanged.
    pub fn set_merger_handlers(&mut self, handlers: MergerHandlers) -> Result<()> {
        if let Some(id) = self.registry.find_by_name(MERGER_QUEUE_MODULE) {
            for target in [&handlers.merger, &handlers.disruption] {
                let dependency = handler_dependency(target);
                if !self.registry.get(id)?.dependencies().contains(&dependency) {
                    self.declare_dependency(id, dependency)?;
                }
            }
        }
        self.merger_handlers = handlers;
        Ok(())
    }

    #[must_use]
    pub fn errors(&self) -> &ErrorHistory {
        &self.errors
    }

    /// Record an error against `module`
    ///
    /// Call depth and the calling module are filled in from the call stack.
    pub fn record_error(&mut self, module: ModuleId, mut info: ErrorInfo) {
        info.call_depth = self.call_stack.depth();
        info.caller = self
            .call_stack
            .current()
            .filter(|frame| frame.callee == module)
            .and_then(|frame| frame.caller.module_id());

        let name = self.registry.name_of(module);
        match info.severity {
            Severity::Info => info!("[{}] {}", name, info),
            Severity::Warning => warn!("[{}] {}", name, info),
            Severity::Error | Severity::Fatal => error!("[{}] {}", name, info),
        }
        self.errors.record(module, info);
    }

    #[must_use]
    pub fn error_context(&self, module: ModuleId) -> Option<&ErrorContext> {
        self.errors.context(module)
    }

    #[must_use]
    pub fn error_count(&self, module: ModuleId) -> usize {
        self.errors.error_count(module)
    }

    pub fn clear_errors(&mut self, module: ModuleId) {
        self.errors.clear(module);
    }

    #[must_use]
    pub fn format_error_history(&self, module: ModuleId, max_len: usize) -> String {
        let name = self.registry.name_of(module);
        match self.errors.context(module) {
            Some(ctx) => ctx.format(&name, max_len),
            None => crate::diagnostics::fit_to_length(
                format!("No errors recorded for {name}\n"),
                max_len,
            ),
        }
    }

    /// One integration sub-step: HALO, GALAXY for each unmerged galaxy,
    /// then POST
    ///
    /// The merger queue is emptied first, so events only live for the
    /// sub-step that raised them.
    ///
    /// # Errors
    /// The first phase that aborts.
    pub fn run_substep(&mut self, pipeline: &mut Pipeline, context: &mut PipelineContext) -> Result<()> {
        self.merger_queue.reset();

        pipeline.execute(self, context, Phase::Halo)?;

        for idx in 0..context.galaxies.len() {
            if context.galaxies[idx].is_merged() {
                continue;
            }
            context.current_galaxy = Some(idx);
            let result = pipeline.execute(self, context, Phase::Galaxy);
            if result.is_err() {
                context.current_galaxy = None;
                return result;
            }
        }
        context.current_galaxy = None;

        pipeline.execute(self, context, Phase::Post)
    }

    /// FINAL phase of a unit of work
    ///
    /// # Errors
    /// The pipeline's error if the phase aborts.
    pub fn finish_unit(&mut self, pipeline: &mut Pipeline, context: &mut PipelineContext) -> Result<()> {
        pipeline.execute(self, context, Phase::Final)
    }

    /// Run `substeps` sub-steps and then the FINAL phase
    ///
    /// # Errors
    /// The first phase that aborts; later sub-steps are not run.
    pub fn evolve(
        &mut self,
        pipeline: &mut Pipeline,
        context: &mut PipelineContext,
        substeps: usize,
    ) -> Result<()> {
        for step in 0..substeps {
            context.step = step;
            self.run_substep(pipeline, context)?;
        }
        self.finish_unit(pipeline, context)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeLimits::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("call_depth", &self.call_stack.depth())
            .field("merger_queue", &self.merger_queue.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
