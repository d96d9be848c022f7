//! Module registry
//!
//! Owns every registered module for the life of the runtime:
//! - Sequential, never-reused ids
//! - Lifecycle: registered -> initialized -> active
//! - One active module per module type
//! - Dependency validation before activation
//! - Library handles of dynamically loaded modules

pub mod loader;
pub mod manifest;

use crate::callback::FunctionEntry;
use crate::config::{ConfigStore, RuntimeLimits};
use crate::error::{Result, RuntimeError};
use crate::module::{ModuleDependency, ModuleDescriptor, ModuleId, ModuleState, ModuleType};
use crate::version::Version;
use libloading::Library;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

pub use loader::{LibrarySource, LoadedModule, ModuleFactory, ModuleSource, StaticSource};
pub use manifest::Manifest;

/// Where a registered module came from
pub enum ModuleOrigin {
    Static,
    Library { path: PathBuf, library: Library },
}

impl fmt::Debug for ModuleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("Static"),
            Self::Library { path, .. } => f.debug_struct("Library").field("path", path).finish(),
        }
    }
}

/// Runtime record of one registered module
// Field order matters: everything that may point into a loaded library is
// dropped before `origin`.
pub struct RegistryEntry {
    id: ModuleId,
    state: Option<Rc<RefCell<ModuleState>>>,
    functions: Vec<FunctionEntry>,
    dependencies: Vec<ModuleDependency>,
    descriptor: ModuleDescriptor,
    active: bool,
    origin: ModuleOrigin,
}

impl RegistryEntry {
    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    #[must_use]
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.descriptor.version
    }

    #[must_use]
    pub fn module_type(&self) -> ModuleType {
        self.descriptor.module_type
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.origin, ModuleOrigin::Library { .. })
    }

    #[must_use]
    pub fn library_path(&self) -> Option<&Path> {
        match &self.origin {
            ModuleOrigin::Library { path, .. } => Some(path),
            ModuleOrigin::Static => None,
        }
    }

    #[must_use]
    pub fn dependencies(&self) -> &[ModuleDependency] {
        &self.dependencies
    }

    #[must_use]
    pub fn functions(&self) -> &[FunctionEntry] {
        &self.functions
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Shared handle to the module state, `None` until initialized
    #[must_use]
    pub(crate) fn state_handle(&self) -> Option<Rc<RefCell<ModuleState>>> {
        self.state.clone()
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("initialized", &self.is_initialized())
            .field("active", &self.active)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Table of registered modules
#[derive(Debug)]
pub struct Registry {
    /// Indexed by id; retired ids keep an empty slot
    slots: Vec<Option<RegistryEntry>>,
    active: HashMap<ModuleType, ModuleId>,
    limits: RuntimeLimits,
}

impl Registry {
    #[must_use]
    pub fn new(limits: RuntimeLimits) -> Self {
        Self {
            slots: Vec::new(),
            active: HashMap::new(),
            limits,
        }
    }

    /// Register a compiled-in module
    ///
    /// # Errors
    /// `InvalidArguments` for an empty or duplicate name or a malformed
    /// function table, `OutOfMemory` when the registry is full.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<ModuleId> {
        self.register_with_origin(descriptor, ModuleOrigin::Static)
    }

    pub(crate) fn register_with_origin(
        &mut self,
        descriptor: ModuleDescriptor,
        origin: ModuleOrigin,
    ) -> Result<ModuleId> {
        let (id, functions) = match self.check_registration(&descriptor) {
            Ok(checked) => checked,
            Err(e) => {
                // The descriptor's code may live in the library
                drop(descriptor);
                drop(origin);
                return Err(e);
            }
        };

        info!(
            "Registered module '{}' v{} ({}) as {}",
            descriptor.name, descriptor.version, descriptor.module_type, id
        );

        let dependencies = descriptor.dependencies.clone();
        self.slots.push(Some(RegistryEntry {
            id,
            state: None,
            functions,
            dependencies,
            descriptor,
            active: false,
            origin,
        }));
        Ok(id)
    }

    /// Everything `register` checks, without taking ownership
    fn check_registration(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<(ModuleId, Vec<FunctionEntry>)> {
        if descriptor.name.trim().is_empty() {
            return Err(RuntimeError::InvalidArguments(
                "module name must not be empty".to_string(),
            ));
        }
        if self.find_by_name(&descriptor.name).is_some() {
            return Err(RuntimeError::InvalidArguments(format!(
                "module '{}' is already registered",
                descriptor.name
            )));
        }
        if self.len() >= self.limits.max_modules {
            return Err(RuntimeError::OutOfMemory(format!(
                "module registry full ({} modules)",
                self.limits.max_modules
            )));
        }
        if descriptor.functions.len() > self.limits.max_functions_per_module {
            return Err(RuntimeError::OutOfMemory(format!(
                "module '{}' exports {} functions, limit is {}",
                descriptor.name,
                descriptor.functions.len(),
                self.limits.max_functions_per_module
            )));
        }
        if descriptor.dependencies.len() > self.limits.max_dependencies_per_module {
            return Err(RuntimeError::OutOfMemory(format!(
                "module '{}' declares {} dependencies, limit is {}",
                descriptor.name,
                descriptor.dependencies.len(),
                self.limits.max_dependencies_per_module
            )));
        }

        let mut functions: Vec<FunctionEntry> = Vec::with_capacity(descriptor.functions.len());
        for entry in &descriptor.functions {
            validate_function_name(&descriptor.name, &functions, &entry.name)?;
            functions.push(entry.clone());
        }

        let id = ModuleId(u32::try_from(self.slots.len()).map_err(|_| {
            RuntimeError::OutOfMemory("module id space exhausted".to_string())
        })?);
        Ok((id, functions))
    }

    /// Number of live (not unregistered) modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live modules in registration order
    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<ModuleId> {
        self.iter().find(|e| e.name() == name).map(RegistryEntry::id)
    }

    /// # Errors
    /// `ModuleNotFound` for an unknown or unregistered id.
    pub fn get(&self, id: ModuleId) -> Result<&RegistryEntry> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::ModuleNotFound(format!("module id {id}")))
    }

    fn get_mut(&mut self, id: ModuleId) -> Result<&mut RegistryEntry> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| RuntimeError::ModuleNotFound(format!("module id {id}")))
    }

    /// The active module of `module_type`
    #[must_use]
    pub fn get_active(&self, module_type: ModuleType) -> Option<&RegistryEntry> {
        self.active_id(module_type).and_then(|id| self.get(id).ok())
    }

    #[must_use]
    pub fn active_id(&self, module_type: ModuleType) -> Option<ModuleId> {
        self.active.get(&module_type).copied()
    }

    /// Every active module, ordered by module type
    #[must_use]
    pub fn active_modules(&self) -> Vec<&RegistryEntry> {
        ModuleType::ALL
            .iter()
            .filter_map(|ty| self.get_active(*ty))
            .collect()
    }

    /// Resolve a call or step target: the named module if a name is given,
    /// otherwise the active module of `module_type`
    ///
    /// # Errors
    /// `ModuleNotFound` when nothing matches, `DependencyConflict` when the
    /// named module has a different type.
    pub fn resolve(&self, module_type: ModuleType, name: Option<&str>) -> Result<ModuleId> {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                let id = self
                    .find_by_name(name)
                    .ok_or_else(|| RuntimeError::ModuleNotFound(format!("module '{name}'")))?;
                let entry = self.get(id)?;
                if entry.module_type() != module_type {
                    return Err(RuntimeError::DependencyConflict(format!(
                        "module '{name}' is of type {}, expected {module_type}",
                        entry.module_type()
                    )));
                }
                Ok(id)
            }
            None => self.active_id(module_type).ok_or_else(|| {
                RuntimeError::ModuleNotFound(format!("no active module of type {module_type}"))
            }),
        }
    }

    /// Display name for diagnostics, falling back to the id
    #[must_use]
    pub fn name_of(&self, id: ModuleId) -> String {
        self.get(id)
            .map_or_else(|_| format!("<module {id}>"), |e| e.name().to_string())
    }

    /// Run the module's `initialize` entry point
    ///
    /// # Errors
    /// `AlreadyInitialized` on a second call, or whatever the module's
    /// `initialize` returns.
    pub fn initialize(&mut self, id: ModuleId, config: &dyn ConfigStore) -> Result<()> {
        let entry = self.get_mut(id)?;
        if entry.is_initialized() {
            return Err(RuntimeError::AlreadyInitialized(entry.name().to_string()));
        }

        let state = entry.descriptor.implementation.initialize(config)?;
        entry.state = Some(Rc::new(RefCell::new(state)));
        debug!("Initialized module '{}'", entry.name());
        Ok(())
    }

    /// Initialize every module that is not yet initialized
    ///
    /// Returns the number of modules that failed; failures are logged.
    pub fn initialize_all(&mut self, config: &dyn ConfigStore) -> usize {
        let pending: Vec<ModuleId> = self
            .iter()
            .filter(|e| !e.is_initialized())
            .map(RegistryEntry::id)
            .collect();

        let mut failures = 0;
        for id in pending {
            if let Err(e) = self.initialize(id, config) {
                warn!("Failed to initialize module '{}': {}", self.name_of(id), e);
                failures += 1;
            }
        }
        failures
    }

    /// Forward a parameter change to the module's `configure` entry point
    ///
    /// # Errors
    /// `NotInitialized` before `initialize`, or the module's own error.
    pub fn configure(&mut self, id: ModuleId, key: &str, value: &str) -> Result<()> {
        let entry = self.get(id)?;
        let state = entry
            .state_handle()
            .ok_or_else(|| RuntimeError::NotInitialized(entry.name().to_string()))?;
        let implementation = Rc::clone(&entry.descriptor.implementation);
        let mut state = state.try_borrow_mut().map_err(|_| {
            RuntimeError::OperationFailed(format!(
                "module '{}' is executing and cannot be reconfigured",
                entry.name()
            ))
        })?;
        implementation.configure(state.as_mut(), key, value)
    }

    /// Check every declared dependency of a registered module
    ///
    /// # Errors
    /// The first `DependencyNotFound` or `DependencyConflict` encountered.
    pub fn validate_dependencies(&self, id: ModuleId) -> Result<()> {
        let entry = self.get(id)?;
        self.check_dependencies(entry.name(), entry.dependencies())
    }

    /// Check a dependency list on behalf of `owner`
    ///
    /// Unmet optional dependencies are logged and accepted.
    ///
    /// # Errors
    /// `DependencyNotFound` for a missing required target,
    /// `DependencyConflict` for a type or version mismatch.
    pub fn check_dependencies(&self, owner: &str, dependencies: &[ModuleDependency]) -> Result<()> {
        for dependency in dependencies {
            if let Err(e) = self.check_dependency(owner, dependency) {
                if dependency.optional {
                    warn!("Optional dependency of '{}' not satisfied: {}", owner, e);
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_dependency(&self, owner: &str, dependency: &ModuleDependency) -> Result<()> {
        let target = match (&dependency.name, dependency.module_type) {
            (Some(name), _) => self.find_by_name(name).and_then(|id| self.get(id).ok()),
            (None, Some(ty)) => self.get_active(ty),
            (None, None) => {
                return Err(RuntimeError::InvalidArguments(format!(
                    "dependency of '{owner}' names neither a module nor a type"
                )))
            }
        };

        let target = target.ok_or_else(|| {
            RuntimeError::DependencyNotFound(format!(
                "'{owner}' requires {}",
                dependency.target_label()
            ))
        })?;

        if let Some(expected) = dependency.module_type {
            if target.module_type() != expected {
                return Err(RuntimeError::DependencyConflict(format!(
                    "'{owner}' requires '{}' to be {expected}, found {}",
                    target.name(),
                    target.module_type()
                )));
            }
        }

        if !dependency.range.satisfies(&target.version()) {
            return Err(RuntimeError::DependencyConflict(format!(
                "'{owner}' requires {} {}, found {}",
                dependency.target_label(),
                dependency.range,
                target.version()
            )));
        }
        Ok(())
    }

    /// Make `id` the active module of its type
    ///
    /// The module must be initialized and its dependencies satisfied; on
    /// success any previously active module of the same type is
    /// deactivated.
    ///
    /// # Errors
    /// `ModuleNotFound`, `NotInitialized`, or the dependency validation
    /// failure.
    pub fn set_active(&mut self, id: ModuleId) -> Result<()> {
        let entry = self.get(id)?;
        if !entry.is_initialized() {
            return Err(RuntimeError::NotInitialized(entry.name().to_string()));
        }
        self.validate_dependencies(id)?;

        let module_type = self.get(id)?.module_type();
        if let Some(previous) = self.active.insert(module_type, id) {
            if previous != id {
                if let Ok(prev) = self.get_mut(previous) {
                    prev.active = false;
                    info!("Deactivated module '{}' ({})", prev.name(), module_type);
                }
            }
        }

        let entry = self.get_mut(id)?;
        entry.active = true;
        info!("Activated module '{}' for {}", entry.name(), module_type);
        Ok(())
    }

    /// Clear the active flag; a no-op for inactive modules
    pub fn deactivate(&mut self, id: ModuleId) -> Result<()> {
        let entry = self.get_mut(id)?;
        if entry.active {
            entry.active = false;
            let module_type = entry.module_type();
            self.active.remove(&module_type);
        }
        Ok(())
    }

    pub(crate) fn add_function(&mut self, id: ModuleId, entry: FunctionEntry) -> Result<()> {
        let limit = self.limits.max_functions_per_module;
        let module = self.get_mut(id)?;
        validate_function_name(module.name(), &module.functions, &entry.name)?;
        if module.functions.len() >= limit {
            return Err(RuntimeError::OutOfMemory(format!(
                "function table of '{}' is full ({limit} entries)",
                module.name()
            )));
        }
        debug!(
            "Module '{}' exports {} function '{}'",
            module.name(),
            entry.return_kind(),
            entry.name
        );
        module.functions.push(entry);
        Ok(())
    }

    pub(crate) fn add_dependency(&mut self, id: ModuleId, dependency: ModuleDependency) -> Result<()> {
        let limit = self.limits.max_dependencies_per_module;
        let module = self.get_mut(id)?;
        if module.dependencies.len() >= limit {
            return Err(RuntimeError::OutOfMemory(format!(
                "dependency list of '{}' is full ({limit} entries)",
                module.name()
            )));
        }
        debug!(
            "Module '{}' depends on {} {}",
            module.name(),
            dependency.target_label(),
            dependency.range
        );
        module.dependencies.push(dependency);
        Ok(())
    }

    /// Run the module's cleanup, release its slot and unload its library
    ///
    /// The id stays retired.
    ///
    /// # Errors
    /// `ModuleNotFound`, or `OperationFailed` while the module's state is
    /// borrowed or shared by a running call. A failing `cleanup` entry
    /// point is logged; the module is removed regardless.
    pub fn unregister(&mut self, id: ModuleId) -> Result<()> {
        let entry = self.get(id)?;
        if let Some(state) = &entry.state {
            if Rc::strong_count(state) > 1 || state.try_borrow_mut().is_err() {
                return Err(RuntimeError::OperationFailed(format!(
                    "module '{}' is executing and cannot be unregistered",
                    entry.name()
                )));
            }
        }

        let Some(mut entry) = self.slots.get_mut(id.index()).and_then(Option::take) else {
            return Err(RuntimeError::ModuleNotFound(format!("module id {id}")));
        };
        if entry.active {
            self.active.remove(&entry.module_type());
        }

        release_state(&mut entry);
        info!("Unregistered module '{}' ({})", entry.name(), id);
        // Library handle goes last, after descriptor and functions
        drop(entry);
        Ok(())
    }

    /// Run `cleanup` without unregistering, returning the module to the
    /// registered state
    ///
    /// An active module is deactivated first.
    ///
    /// # Errors
    /// `ModuleNotFound`, `NotInitialized`, or `OperationFailed` while the
    /// state is in use.
    pub fn cleanup(&mut self, id: ModuleId) -> Result<()> {
        let entry = self.get(id)?;
        let Some(state) = &entry.state else {
            return Err(RuntimeError::NotInitialized(entry.name().to_string()));
        };
        if Rc::strong_count(state) > 1 || state.try_borrow_mut().is_err() {
            return Err(RuntimeError::OperationFailed(format!(
                "module '{}' is executing and cannot be cleaned up",
                entry.name()
            )));
        }
        self.deactivate(id)?;
        let entry = self.get_mut(id)?;
        release_state(entry);
        debug!("Cleaned up module '{}'", entry.name());
        Ok(())
    }

    /// Unregister every module, newest first
    pub fn cleanup_all(&mut self) {
        let ids: Vec<ModuleId> = self.iter().map(RegistryEntry::id).collect();
        for id in ids.into_iter().rev() {
            if let Err(e) = self.unregister(id) {
                warn!("Failed to unregister module {}: {}", id, e);
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

fn validate_function_name(module: &str, existing: &[FunctionEntry], name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RuntimeError::InvalidArguments(format!(
            "module '{module}' exports a function with an empty name"
        )));
    }
    if existing.iter().any(|f| f.name == name) {
        return Err(RuntimeError::InvalidArguments(format!(
            "module '{module}' already exports function '{name}'"
        )));
    }
    Ok(())
}

fn release_state(entry: &mut RegistryEntry) {
    let Some(state) = entry.state.take() else {
        return;
    };
    match Rc::try_unwrap(state) {
        Ok(cell) => {
            if let Err(e) = entry.descriptor.implementation.cleanup(cell.into_inner()) {
                warn!("Cleanup of module '{}' failed: {}", entry.name(), e);
            }
        }
        Err(_) => warn!(
            "State of module '{}' is still shared; dropping without cleanup",
            entry.name()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValueStore;
    use crate::module::{Module, PhaseSet};
    use crate::version::VersionRange;
    use std::cell::Cell;

    struct Counting {
        cleanups: Rc<Cell<u32>>,
    }

    impl Module for Counting {
        fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
            Ok(Box::new(0_u32))
        }

        fn cleanup(&self, _state: ModuleState) -> Result<()> {
            self.cleanups.set(self.cleanups.get() + 1);
            Ok(())
        }
    }

    fn descriptor(name: &str, ty: ModuleType, version: Version) -> ModuleDescriptor {
        ModuleDescriptor::new(
            name,
            ty,
            Counting {
                cleanups: Rc::new(Cell::new(0)),
            },
        )
        .with_version(version)
        .with_phases(PhaseSet::GALAXY)
    }

    fn registry() -> Registry {
        Registry::new(RuntimeLimits::default())
    }

    #[test]
    fn test_register_and_find() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let b = reg.register(descriptor("b", ModuleType::Infall, Version::new(1, 0, 0))).unwrap();
        assert_eq!(reg.find_by_name("a"), Some(a));
        assert_eq!(reg.find_by_name("b"), Some(b));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = registry();
        reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let err = reg
            .register(descriptor("a", ModuleType::Infall, Version::new(1, 0, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut reg = Registry::new(RuntimeLimits {
            max_modules: 1,
            ..RuntimeLimits::default()
        });
        reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let err = reg
            .register(descriptor("b", ModuleType::Cooling, Version::new(1, 0, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        reg.unregister(a).unwrap();
        assert!(reg.find_by_name("a").is_none());
        assert!(reg.get(a).is_err());

        let again = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        assert_ne!(a, again);
    }

    #[test]
    fn test_initialize_once() {
        let mut reg = registry();
        let store = ValueStore::empty();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        reg.initialize(a, &store).unwrap();
        assert!(reg.get(a).unwrap().is_initialized());
        let err = reg.initialize(a, &store).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyInitialized);
    }

    #[test]
    fn test_single_active_per_type() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let b = reg.register(descriptor("b", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();

        let store = ValueStore::empty();
        reg.initialize(a, &store).unwrap();
        reg.initialize(b, &store).unwrap();

        reg.set_active(a).unwrap();
        assert!(reg.get(a).unwrap().is_active());

        reg.set_active(b).unwrap();
        assert!(!reg.get(a).unwrap().is_active());
        assert!(reg.get(b).unwrap().is_active());
        assert_eq!(reg.get_active(ModuleType::Cooling).unwrap().id(), b);

        let active_cooling = reg
            .iter()
            .filter(|e| e.is_active() && e.module_type() == ModuleType::Cooling)
            .count();
        assert_eq!(active_cooling, 1);
    }

    #[test]
    fn test_activation_blocked_by_missing_dependency() {
        let mut reg = registry();
        let sf = reg
            .register(
                descriptor("sf", ModuleType::StarFormation, Version::new(1, 0, 0))
                    .with_dependency(ModuleDependency::on_type(ModuleType::Cooling)),
            )
            .unwrap();
        let store = ValueStore::empty();
        reg.initialize(sf, &store).unwrap();
        let err = reg.set_active(sf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyNotFound);
        assert!(!reg.get(sf).unwrap().is_active());

        let cooling = reg.register(descriptor("c", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        reg.initialize(cooling, &store).unwrap();
        reg.set_active(cooling).unwrap();
        reg.set_active(sf).unwrap();
    }

    #[test]
    fn test_dependency_version_window() {
        let mut reg = registry();
        let cooling = reg.register(descriptor("c", ModuleType::Cooling, Version::new(2, 0, 1))).unwrap();
        reg.initialize(cooling, &ValueStore::empty()).unwrap();
        reg.set_active(cooling).unwrap();

        let range = VersionRange::between(Version::new(1, 2, 0), Version::new(2, 0, 0));
        let deps = [ModuleDependency::on_type(ModuleType::Cooling).with_range(range)];
        let err = reg.check_dependencies("sf", &deps).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyConflict);

        let optional = [ModuleDependency::on_type(ModuleType::Cooling)
            .with_range(range)
            .optional()];
        reg.check_dependencies("sf", &optional).unwrap();
    }

    #[test]
    fn test_named_dependency_type_mismatch() {
        let mut reg = registry();
        reg.register(descriptor("c", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let deps = [ModuleDependency::on_module("c", ModuleType::Infall)];
        let err = reg.check_dependencies("x", &deps).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyConflict);

        let untyped = [ModuleDependency::on_name("c")];
        reg.check_dependencies("x", &untyped).unwrap();
    }

    #[test]
    fn test_unregister_runs_cleanup_and_clears_active() {
        let cleanups = Rc::new(Cell::new(0));
        let mut reg = registry();
        let id = reg
            .register(ModuleDescriptor::new(
                "a",
                ModuleType::Feedback,
                Counting {
                    cleanups: Rc::clone(&cleanups),
                },
            ))
            .unwrap();
        reg.initialize(id, &ValueStore::empty()).unwrap();
        reg.set_active(id).unwrap();

        reg.unregister(id).unwrap();
        assert_eq!(cleanups.get(), 1);
        assert!(reg.get_active(ModuleType::Feedback).is_none());
    }

    #[test]
    fn test_resolve_by_name_and_type() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        assert_eq!(reg.resolve(ModuleType::Cooling, Some("a")).unwrap(), a);
        assert!(reg.resolve(ModuleType::Cooling, None).is_err());
        reg.initialize(a, &ValueStore::empty()).unwrap();
        reg.set_active(a).unwrap();
        assert_eq!(reg.resolve(ModuleType::Cooling, None).unwrap(), a);
        assert!(reg.resolve(ModuleType::Infall, Some("a")).is_err());
    }

    #[test]
    fn test_activation_requires_initialization() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Infall, Version::new(1, 0, 0))).unwrap();
        let err = reg.set_active(a).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotInitialized);
        assert!(!reg.get(a).unwrap().is_active());
        assert!(reg.get_active(ModuleType::Infall).is_none());
    }

    #[test]
    fn test_failed_registration_leaves_registry_unchanged() {
        let mut reg = registry();
        let a = reg.register(descriptor("a", ModuleType::Cooling, Version::new(1, 0, 0))).unwrap();
        let duplicate = descriptor("a", ModuleType::Infall, Version::new(1, 0, 0));
        let err = reg
            .register_with_origin(duplicate, ModuleOrigin::Static)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArguments);
        assert_eq!(reg.len(), 1);

        // The rejected attempt does not consume an id
        let b = reg.register(descriptor("b", ModuleType::Infall, Version::new(1, 0, 0))).unwrap();
        assert_eq!(b.index(), a.index() + 1);
    }

    #[test]
    fn test_configure_reaches_module_state() {
        struct Rate;

        impl Module for Rate {
            fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
                Ok(Box::new(0.5_f64))
            }

            fn configure(&self, state: &mut dyn std::any::Any, key: &str, value: &str) -> Result<()> {
                let rate = state
                    .downcast_mut::<f64>()
                    .ok_or_else(|| RuntimeError::InvalidArguments("state".to_string()))?;
                match (key, value.parse()) {
                    ("rate", Ok(v)) => {
                        *rate = v;
                        Ok(())
                    }
                    _ => Err(RuntimeError::InvalidArguments(format!("{key}={value}"))),
                }
            }
        }

        let mut reg = registry();
        let id = reg.register(ModuleDescriptor::new("rate", ModuleType::Cooling, Rate)).unwrap();
        let err = reg.configure(id, "rate", "0.2").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotInitialized);

        reg.initialize(id, &ValueStore::empty()).unwrap();
        reg.configure(id, "rate", "0.2").unwrap();
        assert!(reg.configure(id, "rate", "fast").is_err());

        let state = reg.get(id).unwrap().state_handle().unwrap();
        assert_eq!(state.borrow().downcast_ref::<f64>(), Some(&0.2));
    }

    #[test]
    fn test_cleanup_returns_module_to_registered() {
        let cleanups = Rc::new(Cell::new(0));
        let mut reg = registry();
        let id = reg
            .register(ModuleDescriptor::new(
                "a",
                ModuleType::Feedback,
                Counting {
                    cleanups: Rc::clone(&cleanups),
                },
            ))
            .unwrap();
        let store = ValueStore::empty();
        assert_eq!(
            reg.cleanup(id).unwrap_err().kind(),
            crate::error::ErrorKind::NotInitialized
        );

        reg.initialize(id, &store).unwrap();
        reg.set_active(id).unwrap();
        reg.cleanup(id).unwrap();
        assert_eq!(cleanups.get(), 1);
        let entry = reg.get(id).unwrap();
        assert!(!entry.is_initialized());
        assert!(!entry.is_active());
        assert!(reg.get_active(ModuleType::Feedback).is_none());

        reg.initialize(id, &store).unwrap();
        reg.set_active(id).unwrap();
        assert_eq!(reg.get_active(ModuleType::Feedback).unwrap().id(), id);
    }

    #[test]
    fn test_shared_state_blocks_unregister() {
        let cleanups = Rc::new(Cell::new(0));
        let mut reg = registry();
        let id = reg
            .register(ModuleDescriptor::new(
                "a",
                ModuleType::Misc,
                Counting {
                    cleanups: Rc::clone(&cleanups),
                },
            ))
            .unwrap();
        reg.initialize(id, &ValueStore::empty()).unwrap();

        let held = reg.get(id).unwrap().state_handle().unwrap();
        let err = reg.unregister(id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OperationFailed);
        assert!(reg.cleanup(id).is_err());
        assert_eq!(cleanups.get(), 0);

        drop(held);
        reg.unregister(id).unwrap();
        assert_eq!(cleanups.get(), 1);
    }
}
