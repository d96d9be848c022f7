//! Phased pipeline execution
//!
//! A [`Pipeline`] is an ordered list of steps, each naming a module type and
//! optionally a specific module. Executing a phase runs every enabled step
//! in order against a shared [`PipelineContext`]:
//!
//! ```text
//! NotStarted -> (StepBefore -> StepExecuting -> StepAfter)* -> Completed | Aborted
//! ```
//!
//! A required step whose module is missing or fails aborts the run. Optional
//! steps are skipped or tolerated.

mod context;

pub use context::{Galaxy, PipelineContext, CENTRAL, ORPHAN, SATELLITE};

use crate::callback::PhaseCall;
use crate::callstack::CallFrame;
use crate::config::ConfigStore;
use crate::diagnostics::{ErrorInfo, Severity, TRACE_LOG_LIMIT};
use crate::error::{Result, RuntimeError};
use crate::module::{Caller, ModuleId, ModuleType, Phase};
use crate::modules::MERGER_QUEUE_MODULE;
use crate::registry::Registry;
use crate::runtime::Runtime;
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Missing-module warnings logged per pipeline before dropping to debug
const MISSING_MODULE_WARNINGS: usize = 5;

/// One pipeline step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub module_type: ModuleType,
    /// Specific module; `None` runs the active module of `module_type`
    pub module_name: Option<String>,
    /// Generated from type and position when left empty
    pub step_name: String,
    pub enabled: bool,
    pub optional: bool,
}

impl PipelineStep {
    #[must_use]
    pub fn new(module_type: ModuleType) -> Self {
        Self {
            module_type,
            module_name: None,
            step_name: String::new(),
            enabled: true,
            optional: false,
        }
    }

    #[must_use]
    pub fn named(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = step_name.into();
        self
    }

    #[must_use]
    pub fn module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Where a pipeline run currently is, or how the last one ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    StepBefore,
    StepExecuting,
    StepAfter,
    Completed,
    Aborted,
}

/// Notification sent to observers; never alters control flow
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    StepBefore {
        step: &'a str,
        index: usize,
        phase: Phase,
        module: ModuleId,
    },
    StepAfter {
        step: &'a str,
        index: usize,
        phase: Phase,
        module: ModuleId,
        success: bool,
    },
    StepError {
        step: &'a str,
        index: usize,
        phase: Phase,
        error: &'a RuntimeError,
    },
}

/// Receives [`PipelineEvent`]s
pub trait PipelineObserver {
    fn on_event(&mut self, event: &PipelineEvent<'_>);
}

/// Outcome counts of the most recent run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub skipped: usize,
    /// Names of optional steps whose handler failed
    pub failed_optional: Vec<String>,
}

/// Ordered, editable list of steps
pub struct Pipeline {
    name: String,
    steps: Vec<PipelineStep>,
    max_steps: usize,
    current_step: Option<usize>,
    run_state: RunState,
    last_summary: RunSummary,
    missing_reports: usize,
    observers: Vec<Box<dyn PipelineObserver>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, max_steps: usize) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            max_steps,
            current_step: None,
            run_state: RunState::NotStarted,
            last_summary: RunSummary::default(),
            missing_reports: 0,
            observers: Vec::new(),
        }
    }

    /// The standard physics sequence
    ///
    /// Infall, reincorporation, cooling, star formation and feedback are
    /// required; the remaining steps run only when a module is available.
    /// The last step drains the merger event queue in the POST phase.
    pub fn default_physics(max_steps: usize) -> Result<Self> {
        let mut pipeline = Self::new("default", max_steps);
        for step in [
            PipelineStep::new(ModuleType::Infall).named("infall"),
            PipelineStep::new(ModuleType::Reincorporation).named("reincorporation"),
            PipelineStep::new(ModuleType::Cooling).named("cooling"),
            PipelineStep::new(ModuleType::StarFormation).named("star_formation"),
            PipelineStep::new(ModuleType::Feedback).named("feedback"),
            PipelineStep::new(ModuleType::Agn).named("agn").optional(),
            PipelineStep::new(ModuleType::DiskInstability)
                .named("disk_instability")
                .optional(),
            PipelineStep::new(ModuleType::Mergers).named("mergers").optional(),
            PipelineStep::new(ModuleType::Misc)
                .module(MERGER_QUEUE_MODULE)
                .named("merger_queue")
                .optional(),
        ] {
            pipeline.add_step(step)?;
        }
        Ok(pipeline)
    }

    /// Build a pipeline from an array of `{type, module?, name?, enabled?,
    /// optional?}` objects at `path`
    ///
    /// # Errors
    /// `InvalidArguments` for a missing or unknown `type`, `OutOfMemory`
    /// past `max_steps`.
    pub fn from_config(
        name: impl Into<String>,
        store: &dyn ConfigStore,
        path: &str,
        max_steps: usize,
    ) -> Result<Self> {
        let mut pipeline = Self::new(name, max_steps);
        for idx in 0..store.get_array_size(path) {
            let Some(item) = store.get_array_element(path, idx) else {
                continue;
            };
            let type_name = item.get_string("type", "");
            let module_type: ModuleType = type_name.parse().map_err(|_| {
                RuntimeError::InvalidArguments(format!(
                    "{path}.{idx}: unknown or missing step type '{type_name}'"
                ))
            })?;

            let mut step = PipelineStep::new(module_type).named(item.get_string("name", ""));
            let module_name = item.get_string("module", "");
            if !module_name.is_empty() {
                step = step.module(module_name);
            }
            step.enabled = item.get_bool("enabled", true);
            step.optional = item.get_bool("optional", false);
            pipeline.add_step(step)?;
        }
        Ok(pipeline)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step being executed, if a run is in progress
    #[must_use]
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    #[must_use]
    pub fn last_run_state(&self) -> RunState {
        self.run_state
    }

    #[must_use]
    pub fn last_summary(&self) -> &RunSummary {
        &self.last_summary
    }

    pub fn add_observer(&mut self, observer: Box<dyn PipelineObserver>) {
        self.observers.push(observer);
    }

    /// Append a step, returning its index
    pub fn add_step(&mut self, step: PipelineStep) -> Result<usize> {
        let index = self.steps.len();
        self.insert_step(index, step)?;
        Ok(index)
    }

    /// Insert a step at `index`
    ///
    /// # Errors
    /// `InvalidArguments` for an index past the end, `OutOfMemory` when the
    /// pipeline is full.
    pub fn insert_step(&mut self, index: usize, mut step: PipelineStep) -> Result<()> {
        if index > self.steps.len() {
            return Err(self.bad_index(index));
        }
        if self.steps.len() >= self.max_steps {
            return Err(RuntimeError::OutOfMemory(format!(
                "pipeline '{}' is full ({} steps)",
                self.name, self.max_steps
            )));
        }
        if step.step_name.is_empty() {
            step.step_name = format!("{}_{}", step.module_type, index);
        }
        debug!("Pipeline '{}': step '{}' at {}", self.name, step.step_name, index);
        self.steps.insert(index, step);
        Ok(())
    }

    /// # Errors
    /// `InvalidArguments` for an index past the end.
    pub fn remove_step(&mut self, index: usize) -> Result<PipelineStep> {
        if index >= self.steps.len() {
            return Err(self.bad_index(index));
        }
        Ok(self.steps.remove(index))
    }

    /// Move the step at `from` so that it ends up at `to`
    ///
    /// # Errors
    /// `InvalidArguments` for an index past the end.
    pub fn move_step(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.steps.len() {
            return Err(self.bad_index(from));
        }
        if to >= self.steps.len() {
            return Err(self.bad_index(to));
        }
        let step = self.steps.remove(from);
        self.steps.insert(to, step);
        Ok(())
    }

    /// # Errors
    /// `InvalidArguments` for an index past the end.
    pub fn set_step_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
        if index >= self.steps.len() {
            return Err(self.bad_index(index));
        }
        self.steps[index].enabled = enabled;
        Ok(())
    }

    /// Index of the first step called `step_name`
    #[must_use]
    pub fn find_step_by_name(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_name == step_name)
    }

    fn bad_index(&self, index: usize) -> RuntimeError {
        RuntimeError::InvalidArguments(format!(
            "step index {index} out of range (pipeline has {} steps)",
            self.steps.len()
        ))
    }

    /// Check that every enabled step resolves to a module
    ///
    /// Returns `false` if a required step cannot be resolved. The failure is
    /// logged but does not prevent execution.
    pub fn validate(&self, registry: &Registry) -> bool {
        let mut valid = true;
        for (idx, step) in self.steps.iter().enumerate().filter(|(_, s)| s.enabled) {
            match registry.resolve(step.module_type, step.module_name.as_deref()) {
                Ok(id) => debug!(
                    "Pipeline '{}' step {} '{}' -> {}",
                    self.name,
                    idx,
                    step.step_name,
                    registry.name_of(id)
                ),
                Err(e) if step.optional => debug!(
                    "Pipeline '{}' optional step '{}' has no module: {}",
                    self.name, step.step_name, e
                ),
                Err(e) => {
                    error!(
                        "Pipeline '{}' required step '{}' has no module: {}",
                        self.name, step.step_name, e
                    );
                    valid = false;
                }
            }
        }
        valid
    }

    /// Run every enabled step for `phase`
    ///
    /// # Errors
    /// The error of the first required step that has no module or fails.
    pub fn execute(
        &mut self,
        runtime: &mut Runtime,
        context: &mut PipelineContext,
        phase: Phase,
    ) -> Result<()> {
        context.phase = phase;
        self.last_summary = RunSummary::default();
        let result = self.run_steps(runtime, context, phase);
        self.current_step = None;
        self.run_state = if result.is_ok() {
            RunState::Completed
        } else {
            RunState::Aborted
        };
        result
    }

    fn run_steps(
        &mut self,
        runtime: &mut Runtime,
        context: &mut PipelineContext,
        phase: Phase,
    ) -> Result<()> {
        for index in 0..self.steps.len() {
            let step = self.steps[index].clone();
            if !step.enabled {
                self.last_summary.skipped += 1;
                continue;
            }

            let module = match runtime
                .registry()
                .resolve(step.module_type, step.module_name.as_deref())
            {
                Ok(id) => id,
                Err(e) if step.optional => {
                    self.report_missing(&step, &e);
                    self.last_summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(
                        "Pipeline '{}' aborted at {}: required step '{}' has no module: {}",
                        self.name, phase, step.step_name, e
                    );
                    self.notify(&PipelineEvent::StepError {
                        step: &step.step_name,
                        index,
                        phase,
                        error: &e,
                    });
                    return Err(e);
                }
            };

            if !runtime.registry().get(module)?.descriptor().handles(phase) {
                debug!(
                    "Step '{}': module {} has no {} handler",
                    step.step_name, module, phase
                );
                self.last_summary.skipped += 1;
                continue;
            }

            self.current_step = Some(index);
            self.run_state = RunState::StepBefore;
            self.notify(&PipelineEvent::StepBefore {
                step: &step.step_name,
                index,
                phase,
                module,
            });

            self.run_state = RunState::StepExecuting;
            let result = runtime.execute_module_phase(module, phase, context);
            self.last_summary.executed += 1;

            self.run_state = RunState::StepAfter;
            self.notify(&PipelineEvent::StepAfter {
                step: &step.step_name,
                index,
                phase,
                module,
                success: result.is_ok(),
            });

            if let Err(e) = result {
                self.notify(&PipelineEvent::StepError {
                    step: &step.step_name,
                    index,
                    phase,
                    error: &e,
                });
                if step.optional {
                    warn!(
                        "Optional step '{}' failed in {} phase: {}",
                        step.step_name, phase, e
                    );
                    self.last_summary.failed_optional.push(step.step_name.clone());
                    continue;
                }
                error!(
                    "Pipeline '{}' aborted at {}: step '{}' failed: {}",
                    self.name, phase, step.step_name, e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn report_missing(&mut self, step: &PipelineStep, err: &RuntimeError) {
        self.missing_reports += 1;
        if self.missing_reports <= MISSING_MODULE_WARNINGS {
            warn!(
                "Skipping optional step '{}' in pipeline '{}': {}",
                step.step_name, self.name, err
            );
            if self.missing_reports == MISSING_MODULE_WARNINGS {
                warn!(
                    "Further missing-module messages for pipeline '{}' are suppressed",
                    self.name
                );
            }
        } else {
            debug!(
                "Skipping optional step '{}' in pipeline '{}': {}",
                step.step_name, self.name, err
            );
        }
    }

    fn notify(&mut self, event: &PipelineEvent<'_>) {
        for observer in &mut self.observers {
            observer.on_event(event);
        }
    }

    /// One line per step
    #[must_use]
    pub fn describe(&self, registry: &Registry) -> String {
        let mut out = format!("Pipeline '{}' ({} steps):\n", self.name, self.steps.len());
        for (idx, step) in self.steps.iter().enumerate() {
            let module = registry
                .resolve(step.module_type, step.module_name.as_deref())
                .map_or_else(|_| "<none>".to_string(), |id| registry.name_of(id));
            let _ = writeln!(
                out,
                "  {idx:2}. {:<20} type={:<16} module={:<24} {}{}",
                step.step_name,
                step.module_type,
                module,
                if step.enabled { "enabled" } else { "disabled" },
                if step.optional { ", optional" } else { "" }
            );
        }
        out
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("current_step", &self.current_step)
            .field("run_state", &self.run_state)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Run a module's handler for `phase` on behalf of the host
    ///
    /// The handler runs inside a call frame, so modules it calls cannot
    /// call back into it. A handler error is recorded in the module's error
    /// history before it is returned.
    ///
    /// # Errors
    /// `ModuleNotFound`, `NotInitialized`, `CircularDependency` when the
    /// module is already executing, `CallStackOverflow`, or the handler's
    /// own error.
    pub fn execute_module_phase(
        &mut self,
        module: ModuleId,
        phase: Phase,
        context: &mut PipelineContext,
    ) -> Result<()> {
        let (implementation, state, name) = {
            let entry = self.registry.get(module)?;
            let state = entry
                .state_handle()
                .ok_or_else(|| RuntimeError::NotInitialized(entry.name().to_string()))?;
            (
                Rc::clone(&entry.descriptor().implementation),
                state,
                entry.name().to_string(),
            )
        };

        if self.call_stack.contains_callee(module) {
            return Err(RuntimeError::CircularDependency(format!(
                "'{name}' is already executing"
            )));
        }

        let function = format!("execute_{}_phase", phase.as_str().to_ascii_lowercase());
        self.call_stack
            .push(CallFrame::new(Caller::Host, module, function))?;

        let result = {
            let mut guard = state.borrow_mut();
            let mut call = PhaseCall {
                runtime: self,
                module_id: module,
                phase,
                state: guard.as_mut(),
                context,
            };
            implementation.execute_phase(&mut call)
        };

        if let Err(e) = &result {
            self.call_stack.annotate_current(e.kind(), e.to_string());
            debug!("{}", self.format_stack_trace_with_errors(TRACE_LOG_LIMIT));
            self.record_error(
                module,
                ErrorInfo::new(
                    e.kind(),
                    Severity::Error,
                    format!("{phase} phase handler failed: {e}"),
                ),
            );
        }
        self.call_stack.pop();
        result
    }
}
