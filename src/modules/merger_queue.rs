use crate::callback::PhaseCall;
use crate::config::ConfigStore;
use crate::diagnostics::{ErrorInfo, Severity};
use crate::error::{ErrorKind, Result};
use crate::merger::{HandlerTarget, MergerHandlers};
use crate::module::{
    Capabilities, Caller, Module, ModuleDependency, ModuleDescriptor, ModuleState, ModuleType,
    Phase, PhaseSet,
};
use tracing::debug;

/// Registered name of the merger queue processor
pub const MERGER_QUEUE_MODULE: &str = "merger_queue";

/// Drains the runtime's merger queue in the POST phase
#[derive(Debug, Default)]
pub struct MergerQueueModule;

impl Module for MergerQueueModule {
    fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
        Ok(Box::new(()))
    }

    fn execute_phase(&self, call: &mut PhaseCall<'_>) -> Result<()> {
        if call.phase != Phase::Post {
            return Ok(());
        }

        let caller = Caller::Module(call.module_id);
        let summary = call.runtime.process_merger_events(caller, call.context)?;
        debug!(
            "Merger queue drained: {} processed, {} skipped, {} failed",
            summary.processed, summary.skipped, summary.failed
        );

        if summary.failed > 0 || summary.skipped > 0 {
            let module = call.module_id;
            call.runtime.record_error(
                module,
                ErrorInfo::new(
                    ErrorKind::OperationFailed,
                    Severity::Warning,
                    format!(
                        "{} merger event(s) failed and {} were skipped",
                        summary.failed, summary.skipped
                    ),
                ),
            );
        }
        Ok(())
    }
}

pub(crate) fn handler_dependency(target: &HandlerTarget) -> ModuleDependency {
    match &target.module_name {
        Some(name) => ModuleDependency::on_module(name.clone(), target.module_type),
        None => ModuleDependency::on_type(target.module_type),
    }
    .optional()
}

/// Descriptor of the merger queue processor, depending on whatever
/// `handlers` dispatch to
#[must_use]
pub fn merger_queue_descriptor(handlers: &MergerHandlers) -> ModuleDescriptor {
    let mut descriptor = ModuleDescriptor::new(MERGER_QUEUE_MODULE, ModuleType::Misc, MergerQueueModule)
        .with_description("Processes deferred merger and disruption events")
        .with_capabilities(Capabilities::DIAGNOSTICS)
        .with_phases(PhaseSet::POST);

    let merger = handler_dependency(&handlers.merger);
    let disruption = handler_dependency(&handlers.disruption);
    if disruption == merger {
        descriptor = descriptor.with_dependency(merger);
    } else {
        descriptor = descriptor.with_dependency(merger).with_dependency(disruption);
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_shape() {
        let d = merger_queue_descriptor(&MergerHandlers::default());
        assert_eq!(d.name, MERGER_QUEUE_MODULE);
        assert_eq!(d.module_type, ModuleType::Misc);
        assert!(d.handles(Phase::Post));
        assert!(!d.handles(Phase::Galaxy));
        // Both default handlers live on the active mergers module
        assert_eq!(d.dependencies.len(), 1);
        assert!(d.dependencies[0].optional);
        assert_eq!(d.dependencies[0].module_type, Some(ModuleType::Mergers));
    }

    #[test]
    fn test_descriptor_with_named_handler() {
        let mut handlers = MergerHandlers::default();
        handlers.disruption.module_name = Some("tidal".to_string());
        let d = merger_queue_descriptor(&handlers);
        assert_eq!(d.dependencies.len(), 2);
        assert_eq!(d.dependencies[1].name.as_deref(), Some("tidal"));
    }
}
