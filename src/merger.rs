//! Deferred merger events
//!
//! Merger and disruption decisions made during the GALAXY phase are queued
//! instead of applied, so every module in that phase sees the same galaxy
//! list. The queue is drained once in the POST phase, each event going to a
//! configurable handler through [`Runtime::invoke`].

use crate::callback::CallResult;
use crate::config::ConfigStore;
use crate::error::{Result, RuntimeError};
use crate::module::{Caller, ModuleType};
use crate::pipeline::PipelineContext;
use crate::runtime::Runtime;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, warn};

/// One proposed interaction between a satellite and its central
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MergerEvent {
    pub satellite: usize,
    pub central: usize,
    /// Remaining merge time; zero or positive means disruption
    pub merge_time: f64,
    pub time: f64,
    pub dt: f64,
    pub halo_nr: i64,
    pub step: usize,
    pub merger_type: i32,
}

impl MergerEvent {
    /// Event raised in the current step of `context`
    #[must_use]
    pub fn from_context(
        context: &PipelineContext,
        satellite: usize,
        central: usize,
        merge_time: f64,
        merger_type: i32,
    ) -> Self {
        Self {
            satellite,
            central,
            merge_time,
            time: context.time,
            dt: context.dt,
            halo_nr: context.halo_nr,
            step: context.step,
            merger_type,
        }
    }

    #[must_use]
    pub fn is_disruption(&self) -> bool {
        self.merge_time >= 0.0
    }
}

/// Bounded queue of pending merger events
#[derive(Debug, Clone)]
pub struct MergerEventQueue {
    events: Vec<MergerEvent>,
    capacity: usize,
}

impl MergerEventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Append an event
    ///
    /// # Errors
    /// `QueueOverflow` when the queue is full; the queue is left unchanged.
    pub fn enqueue(&mut self, event: MergerEvent) -> Result<()> {
        if self.events.len() >= self.capacity {
            error!(
                "Merger queue full ({} events), rejecting satellite {} -> central {}",
                self.capacity, event.satellite, event.central
            );
            return Err(RuntimeError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        self.events.push(event);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn events(&self) -> &[MergerEvent] {
        &self.events
    }
}

/// The module and function an event kind is sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerTarget {
    pub module_type: ModuleType,
    /// Specific module; `None` means the active module of `module_type`
    pub module_name: Option<String>,
    pub function: String,
}

impl HandlerTarget {
    pub fn new(module_type: ModuleType, function: impl Into<String>) -> Self {
        Self {
            module_type,
            module_name: None,
            function: function.into(),
        }
    }

    fn from_store(store: &dyn ConfigStore, prefix: &str, fallback: Self) -> Self {
        let type_name = store.get_string(&format!("{prefix}.type"), "");
        let module_type = if type_name.is_empty() {
            fallback.module_type
        } else {
            type_name.parse().unwrap_or_else(|_| {
                warn!(
                    "Unknown module type '{}' in {}.type, using {}",
                    type_name, prefix, fallback.module_type
                );
                fallback.module_type
            })
        };
        let module_name = Some(store.get_string(&format!("{prefix}.module"), ""))
            .filter(|name| !name.is_empty())
            .or(fallback.module_name);
        let function = store.get_string(&format!("{prefix}.function"), &fallback.function);

        Self {
            module_type,
            module_name,
            function,
        }
    }
}

impl fmt::Display for HandlerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_name {
            Some(name) => write!(f, "{name}::{}", self.function),
            None => write!(f, "{}::{}", self.module_type, self.function),
        }
    }
}

/// Handlers for the two event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergerHandlers {
    pub merger: HandlerTarget,
    pub disruption: HandlerTarget,
}

impl Default for MergerHandlers {
    fn default() -> Self {
        Self {
            merger: HandlerTarget::new(ModuleType::Mergers, "HandleMerger"),
            disruption: HandlerTarget::new(ModuleType::Mergers, "HandleDisruption"),
        }
    }
}

impl MergerHandlers {
    /// Read `mergers.merger.*` and `mergers.disruption.*` (`type`, `module`,
    /// `function`), falling back to the defaults
    #[must_use]
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let defaults = Self::default();
        Self {
            merger: HandlerTarget::from_store(store, "mergers.merger", defaults.merger),
            disruption: HandlerTarget::from_store(store, "mergers.disruption", defaults.disruption),
        }
    }

    #[must_use]
    pub fn for_event(&self, event: &MergerEvent) -> &HandlerTarget {
        if event.is_disruption() {
            &self.disruption
        } else {
            &self.merger
        }
    }
}

/// What a drain did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    /// Events with out-of-range galaxy indices
    pub skipped: usize,
    /// Events whose handler could not be called or reported failure
    pub failed: usize,
}

impl Runtime {
    /// Queue an event for the next drain
    ///
    /// # Errors
    /// `QueueOverflow` when the queue is full.
    pub fn queue_merger(&mut self, event: MergerEvent) -> Result<()> {
        self.merger_queue.enqueue(event)
    }

    /// Send every queued event to its handler, then empty the queue
    ///
    /// Events are handled in queue order against a snapshot taken before the
    /// first handler runs. A bad event or failing handler is logged and the
    /// drain moves on.
    pub fn process_merger_events(
        &mut self,
        caller: Caller,
        context: &mut PipelineContext,
    ) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        if self.merger_queue.is_empty() {
            return Ok(summary);
        }

        let events = self.merger_queue.events().to_vec();
        debug!("Processing {} merger event(s)", events.len());

        for mut event in events {
            let count = context.galaxies.len();
            if event.satellite >= count || event.central >= count {
                warn!(
                    "Skipping merger event with invalid indices: satellite {} central {} ({} galaxies)",
                    event.satellite, event.central, count
                );
                summary.skipped += 1;
                continue;
            }

            let handler = self.merger_handlers.for_event(&event).clone();
            let result = self.invoke(
                caller,
                handler.module_type,
                handler.module_name.as_deref(),
                &handler.function,
                context,
                &mut event,
            );

            match result {
                Ok(outcome @ CallResult::Int(_)) if !outcome.is_success_status() => {
                    warn!(
                        "{} reported failure for satellite {}: {:?}",
                        handler, event.satellite, outcome
                    );
                    summary.failed += 1;
                }
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    warn!(
                        "Failed to dispatch merger event for satellite {} to {}: {}",
                        event.satellite, handler, e
                    );
                    summary.failed += 1;
                }
            }
        }

        self.merger_queue.reset();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValueStore;

    fn event(satellite: usize, merge_time: f64) -> MergerEvent {
        MergerEvent {
            satellite,
            central: 0,
            merge_time,
            time: 1.0,
            dt: 0.1,
            halo_nr: 3,
            step: 0,
            merger_type: 1,
        }
    }

    #[test]
    fn test_enqueue_and_reset() {
        let mut q = MergerEventQueue::new(4);
        q.enqueue(event(1, -1.0)).unwrap();
        q.enqueue(event(2, 0.5)).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.events()[1].satellite, 2);
        q.reset();
        assert!(q.is_empty());
    }

    #[test]
    fn test_overflow_leaves_queue_unchanged() {
        let mut q = MergerEventQueue::new(2);
        q.enqueue(event(1, -1.0)).unwrap();
        q.enqueue(event(2, -1.0)).unwrap();
        let err = q.enqueue(event(3, -1.0)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueueOverflow);
        assert_eq!(q.len(), 2);
        assert_eq!(q.events()[1].satellite, 2);
    }

    #[test]
    fn test_disruption_sign_convention() {
        assert!(event(1, 0.0).is_disruption());
        assert!(event(1, 2.0).is_disruption());
        assert!(!event(1, -0.5).is_disruption());

        let handlers = MergerHandlers::default();
        assert_eq!(handlers.for_event(&event(1, 0.0)).function, "HandleDisruption");
        assert_eq!(handlers.for_event(&event(1, -1.0)).function, "HandleMerger");
    }

    #[test]
    fn test_handlers_from_store() {
        let store = ValueStore::from_yaml_str(
            r#"
mergers:
  merger:
    module: custom_mergers
    function: Merge
  disruption:
    type: misc
"#,
        )
        .unwrap();
        let handlers = MergerHandlers::from_store(&store);
        assert_eq!(handlers.merger.module_name.as_deref(), Some("custom_mergers"));
        assert_eq!(handlers.merger.function, "Merge");
        assert_eq!(handlers.merger.module_type, ModuleType::Mergers);
        assert_eq!(handlers.disruption.module_type, ModuleType::Misc);
        assert_eq!(handlers.disruption.function, "HandleDisruption");
        assert_eq!(handlers.merger.to_string(), "custom_mergers::Merge");
    }
}
