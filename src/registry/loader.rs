use super::manifest::{Manifest, MANIFEST_EXTENSION};
use super::{ModuleOrigin, Registry};
use crate::config::ConfigStore;
use crate::error::{Result, RuntimeError};
use crate::module::{Capabilities, ModuleDependency, ModuleDescriptor, ModuleId};
use libloading::{Library, Symbol};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Symbol every module library must export
pub const FACTORY_SYMBOL: &[u8] = b"galaxy_module_descriptor";

/// Version of the module interface this runtime speaks
pub const MODULE_API_VERSION: u32 = 1;

/// Signature of the exported factory
///
/// The library allocates the descriptor with `Box::into_raw`; the runtime
/// takes ownership. A null return is a load failure.
pub type ModuleFactory = unsafe fn() -> *mut ModuleDescriptor;

/// A module produced by a [`ModuleSource`], ready to register
pub struct LoadedModule {
    pub descriptor: ModuleDescriptor,
    pub origin: ModuleOrigin,
    /// Dependencies declared outside the descriptor, e.g. in a manifest
    pub extra_dependencies: Vec<ModuleDependency>,
    pub auto_initialize: bool,
    pub auto_activate: bool,
}

impl LoadedModule {
    #[must_use]
    pub fn compiled_in(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            origin: ModuleOrigin::Static,
            extra_dependencies: Vec::new(),
            auto_initialize: true,
            auto_activate: true,
        }
    }
}

/// Somewhere modules come from
pub trait ModuleSource {
    /// Produce every module this source can provide
    ///
    /// Individual broken modules are logged and skipped; an error means the
    /// source as a whole is unusable.
    fn load(&mut self) -> Result<Vec<LoadedModule>>;
}

/// Modules compiled into the host binary
#[derive(Default)]
pub struct StaticSource {
    modules: Vec<LoadedModule>,
}

impl StaticSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module that is initialized and activated on load
    #[must_use]
    pub fn with(mut self, descriptor: ModuleDescriptor) -> Self {
        self.modules.push(LoadedModule::compiled_in(descriptor));
        self
    }

    /// Add a module that is only registered
    #[must_use]
    pub fn with_inactive(mut self, descriptor: ModuleDescriptor) -> Self {
        let mut module = LoadedModule::compiled_in(descriptor);
        module.auto_initialize = false;
        module.auto_activate = false;
        self.modules.push(module);
        self
    }
}

impl ModuleSource for StaticSource {
    fn load(&mut self) -> Result<Vec<LoadedModule>> {
        Ok(std::mem::take(&mut self.modules))
    }
}

/// Modules described by manifest files and loaded from shared libraries
pub struct LibrarySource {
    search_paths: Vec<PathBuf>,
}

impl LibrarySource {
    pub fn new<I, P>(search_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: search_paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Manifest files in one directory, sorted by path
    fn manifests_in(dir: &Path) -> Vec<PathBuf> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping module directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut manifests: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(MANIFEST_EXTENSION)
            })
            .collect();
        manifests.sort();
        manifests
    }
}

impl ModuleSource for LibrarySource {
    fn load(&mut self) -> Result<Vec<LoadedModule>> {
        let mut loaded = Vec::new();
        for dir in &self.search_paths {
            for manifest_path in Self::manifests_in(dir) {
                let result = Manifest::load(&manifest_path).and_then(|m| load_library(&m));
                match result {
                    Ok(module) => loaded.push(module),
                    Err(e) => warn!(
                        "Skipping module manifest {}: {}",
                        manifest_path.display(),
                        e
                    ),
                }
            }
        }
        Ok(loaded)
    }
}

/// Load the library a manifest points at and check what it provides
///
/// Name and version mismatches between manifest and descriptor are logged;
/// a type mismatch rejects the module.
///
/// # Errors
/// `ModuleLoadingFailed` for an API version mismatch, a library that cannot
/// be opened, a missing factory symbol, a null descriptor or a type
/// mismatch.
pub fn load_library(manifest: &Manifest) -> Result<LoadedModule> {
    let library_path = manifest.library_path();
    let display_path = library_path.display().to_string();

    if manifest.api_version != MODULE_API_VERSION {
        return Err(RuntimeError::load_failed(
            &display_path,
            format!(
                "module API version {} is not supported (runtime speaks {})",
                manifest.api_version, MODULE_API_VERSION
            ),
        ));
    }

    // Safety: loading a library runs its initializers; module libraries are
    // trusted components of the simulation build. The factory contract is
    // documented on `ModuleFactory`.
    let loaded = unsafe {
        let library = Library::new(&library_path)
            .map_err(|e| RuntimeError::load_failed(&display_path, e.to_string()))?;

        let descriptor_ptr = {
            let factory: Symbol<ModuleFactory> = library.get(FACTORY_SYMBOL).map_err(|e| {
                RuntimeError::load_failed(&display_path, format!("missing factory symbol: {e}"))
            })?;
            factory()
        };

        if descriptor_ptr.is_null() {
            return Err(RuntimeError::load_failed(
                &display_path,
                "module factory returned null",
            ));
        }
        (*Box::from_raw(descriptor_ptr), library)
    };
    let (mut descriptor, library) = loaded;

    if descriptor.module_type != manifest.module_type {
        let reason = format!(
            "library provides a {} module, manifest declares {}",
            descriptor.module_type, manifest.module_type
        );
        // The descriptor's code lives in the library
        drop(descriptor);
        drop(library);
        return Err(RuntimeError::load_failed(&display_path, reason));
    }
    if descriptor.name != manifest.name {
        warn!(
            "Module name mismatch: manifest says '{}', library says '{}'",
            manifest.name, descriptor.name
        );
    }
    if descriptor.version != manifest.version {
        warn!(
            "Module '{}' version mismatch: manifest {}, library {}",
            manifest.name, manifest.version, descriptor.version
        );
    }

    descriptor.capabilities |= manifest.capabilities | Capabilities::DYNAMIC;
    info!(
        "Loaded module library {} ({} v{})",
        display_path, descriptor.name, descriptor.version
    );

    Ok(LoadedModule {
        descriptor,
        origin: ModuleOrigin::Library {
            path: library_path,
            library,
        },
        extra_dependencies: manifest.dependencies.clone(),
        auto_initialize: manifest.auto_initialize,
        auto_activate: manifest.auto_activate,
    })
}

impl Registry {
    /// Register everything a source provides
    ///
    /// Returns the ids of the modules that were registered. Modules that
    /// fail to register, initialize or activate are logged; a module that
    /// registered but failed a later step stays registered.
    pub fn load_from(
        &mut self,
        source: &mut dyn ModuleSource,
        config: &dyn ConfigStore,
    ) -> Result<Vec<ModuleId>> {
        let mut registered = Vec::new();
        for module in source.load()? {
            let LoadedModule {
                descriptor,
                origin,
                extra_dependencies,
                auto_initialize,
                auto_activate,
            } = module;
            let name = descriptor.name.clone();

            let id = match self.register_with_origin(descriptor, origin) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Failed to register module '{}': {}", name, e);
                    continue;
                }
            };
            registered.push(id);

            for dependency in extra_dependencies {
                if let Err(e) = self.add_dependency(id, dependency) {
                    warn!("Dropping dependency of '{}': {}", name, e);
                }
            }

            if auto_initialize {
                if let Err(e) = self.initialize(id, config) {
                    warn!("Failed to initialize module '{}': {}", name, e);
                    continue;
                }
            }
            if auto_activate {
                if let Err(e) = self.set_active(id) {
                    warn!("Failed to activate module '{}': {}", name, e);
                }
            }
        }
        Ok(registered)
    }

    /// Discover and load dynamic modules from manifest files in
    /// `search_paths`
    ///
    /// Returns the number of modules registered.
    pub fn discover<P: AsRef<Path>>(&mut self, search_paths: &[P], config: &dyn ConfigStore) -> usize {
        let mut source = LibrarySource::new(search_paths.iter().map(|p| p.as_ref().to_path_buf()));
        match self.load_from(&mut source, config) {
            Ok(ids) => {
                info!("Discovered {} dynamic module(s)", ids.len());
                ids.len()
            }
            Err(e) => {
                warn!("Module discovery failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeLimits, ValueStore};
    use crate::error::ErrorKind;
    use crate::module::{Module, ModuleState, ModuleType};

    struct Nop;

    impl Module for Nop {
        fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
            Ok(Box::new(()))
        }
    }

    #[test]
    fn test_static_source_registers_and_activates() {
        let mut reg = Registry::new(RuntimeLimits::default());
        let mut source = StaticSource::new()
            .with(ModuleDescriptor::new("cool", ModuleType::Cooling, Nop))
            .with_inactive(ModuleDescriptor::new("cool_alt", ModuleType::Cooling, Nop));

        let ids = reg.load_from(&mut source, &ValueStore::empty()).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(reg.get_active(ModuleType::Cooling).unwrap().name(), "cool");
        assert!(!reg.get(ids[1]).unwrap().is_initialized());

        // A source is drained by loading
        assert!(reg.load_from(&mut source, &ValueStore::empty()).unwrap().is_empty());
    }

    #[test]
    fn test_discover_skips_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ghost.manifest"),
            "name: ghost\nversion: 1.0.0\ntype: cooling\nlibrary: libghost_does_not_exist.so\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

        let mut reg = Registry::new(RuntimeLimits::default());
        let count = reg.discover(&[dir.path()], &ValueStore::empty());
        assert_eq!(count, 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_discover_missing_directory() {
        let mut reg = Registry::new(RuntimeLimits::default());
        let count = reg.discover(&["/definitely/not/here"], &ValueStore::empty());
        assert_eq!(count, 0);
    }

    #[test]
    fn test_load_library_api_version_mismatch() {
        let manifest = Manifest::parse(
            "name: x\nversion: 1.0.0\ntype: misc\nlibrary: libx.so\napi_version: 99\n",
            Path::new("/tmp/x.manifest"),
        )
        .unwrap();
        let err = load_library(&manifest).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ModuleLoadingFailed);
        assert!(err.to_string().contains("API version 99"));
    }

    #[test]
    fn test_load_library_missing_file() {
        let manifest = Manifest::parse(
            "name: x\nversion: 1.0.0\ntype: misc\nlibrary: libx_missing.so\n",
            Path::new("/tmp/x.manifest"),
        )
        .unwrap();
        let err = load_library(&manifest).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ModuleLoadingFailed);
    }
}
