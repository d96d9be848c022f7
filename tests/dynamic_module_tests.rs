//! Loading the `constant_cooling` demo library through manifests
//!
//! The library is built from `demos/plugins` on first use, or taken from
//! `GALAXY_DEMO_MODULE_LIB`. When neither works the tests return early.

use galaxy_runtime::config::ConfigStore;
use galaxy_runtime::module::{
    Capabilities, Caller, Module, ModuleDescriptor, ModuleState, ModuleType, PhaseSet,
};
use galaxy_runtime::pipeline::{Galaxy, Pipeline, PipelineContext, PipelineStep, CENTRAL};
use galaxy_runtime::version::Version;
use galaxy_runtime::{Result, Runtime};
use once_cell::sync::Lazy;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

static DEMO_LIBRARY: Lazy<Option<PathBuf>> = Lazy::new(build_demo_library);

fn build_demo_library() -> Option<PathBuf> {
    if let Some(path) = env::var_os("GALAXY_DEMO_MODULE_LIB") {
        return Some(PathBuf::from(path));
    }

    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let target_dir = root.join("target").join("demo-plugins");
    let cargo = env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
    let build = |offline: bool| {
        let mut cmd = Command::new(&cargo);
        cmd.arg("build").arg("--quiet");
        if offline {
            cmd.arg("--offline");
        }
        cmd.arg("--manifest-path")
            .arg(root.join("demos").join("plugins").join("Cargo.toml"))
            .arg("--target-dir")
            .arg(&target_dir)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    };
    if !build(true) && !build(false) {
        eprintln!("demo module library could not be built; skipping");
        return None;
    }

    let file = format!(
        "{}galaxy_module_constant_cooling{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    );
    let path = target_dir.join("debug").join(file);
    path.exists().then_some(path)
}

/// A module directory holding a copy of the demo library and one manifest
///
/// `{library}` in `manifest` is replaced with the copied file name.
fn module_dir(manifest: &str) -> Option<TempDir> {
    let library = DEMO_LIBRARY.as_ref()?;
    let dir = tempfile::tempdir().unwrap();
    let file_name = library.file_name().unwrap();
    fs::copy(library, dir.path().join(file_name)).unwrap();
    fs::write(
        dir.path().join("constant_cooling.manifest"),
        manifest.replace("{library}", &file_name.to_string_lossy()),
    )
    .unwrap();
    Some(dir)
}

const MANIFEST: &str = "\
name: constant_cooling
version: 1.0.0
type: cooling
library: {library}
auto_initialize: true
auto_activate: true
capabilities: callbacks, configurable
";

struct Plain;

impl Module for Plain {
    fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
        Ok(Box::new(()))
    }
}

#[test]
fn test_discover_loads_initializes_and_activates() {
    let Some(dir) = module_dir(MANIFEST) else {
        return;
    };
    let mut rt = Runtime::default();
    assert_eq!(rt.discover(&[dir.path()]), 1);

    let entry = rt.registry().get_active(ModuleType::Cooling).unwrap();
    assert_eq!(entry.name(), "constant_cooling");
    assert!(entry.is_initialized());
    assert!(entry.is_dynamic());
    assert!(entry.descriptor().capabilities.contains(Capabilities::DYNAMIC | Capabilities::CALLBACKS));
    let id = entry.id();

    let fraction = rt
        .invoke(Caller::Host, ModuleType::Cooling, None, "cooling_fraction", &mut (), &mut ())
        .unwrap();
    assert_eq!(fraction.as_double(), Some(0.1));

    rt.configure_module(id, "fraction", "0.5").unwrap();
    let mut pipeline = Pipeline::new("cooling_only", 4);
    pipeline.add_step(PipelineStep::new(ModuleType::Cooling)).unwrap();
    let mut galaxy = Galaxy::new(0, 0, CENTRAL);
    galaxy.set_property("HotGas", 8.0);
    let mut context = PipelineContext::with_galaxies(vec![galaxy]);
    rt.evolve(&mut pipeline, &mut context, 1).unwrap();

    assert_eq!(context.galaxies[0].property("HotGas"), 4.0);
    assert_eq!(context.galaxies[0].property("ColdGas"), 4.0);

    rt.unregister(id).unwrap();
    assert!(rt.registry().get_active(ModuleType::Cooling).is_none());
}

#[test]
fn test_name_clash_with_library_module_is_rejected() {
    let Some(dir) = module_dir(MANIFEST) else {
        return;
    };
    let mut rt = Runtime::default();
    let existing = rt
        .register(ModuleDescriptor::new("constant_cooling", ModuleType::Cooling, Plain))
        .unwrap();

    assert_eq!(rt.discover(&[dir.path()]), 0);
    assert_eq!(rt.registry().len(), 1);
    assert_eq!(rt.registry().find_by_name("constant_cooling"), Some(existing));
    assert!(!rt.registry().get(existing).unwrap().is_dynamic());

    // The same library still loads once the name is free
    rt.unregister(existing).unwrap();
    assert_eq!(rt.discover(&[dir.path()]), 1);
}

#[test]
fn test_manifest_mismatch_keeps_library_identity() {
    let manifest = MANIFEST
        .replace("name: constant_cooling", "name: cooler")
        .replace("version: 1.0.0", "version: 1.4.0");
    let Some(dir) = module_dir(&manifest) else {
        return;
    };
    let mut rt = Runtime::default();
    assert_eq!(rt.discover(&[dir.path()]), 1);

    assert!(rt.registry().find_by_name("cooler").is_none());
    let id = rt.registry().find_by_name("constant_cooling").unwrap();
    assert_eq!(rt.registry().get(id).unwrap().version(), Version::new(1, 0, 0));
}

#[test]
fn test_manifest_type_mismatch_is_rejected() {
    let Some(dir) = module_dir(&MANIFEST.replace("type: cooling", "type: infall")) else {
        return;
    };
    let mut rt = Runtime::default();
    assert_eq!(rt.discover(&[dir.path()]), 0);
    assert!(rt.registry().is_empty());
}

#[test]
fn test_manifest_dependency_blocks_activation() {
    let manifest = format!("{MANIFEST}dependency.0: infall: 1.0.0\n");
    let Some(dir) = module_dir(&manifest) else {
        return;
    };
    let mut rt = Runtime::default();
    assert_eq!(rt.discover(&[dir.path()]), 1);

    let id = rt.registry().find_by_name("constant_cooling").unwrap();
    let entry = rt.registry().get(id).unwrap();
    assert!(entry.is_initialized());
    assert!(!entry.is_active());
    assert_eq!(entry.dependencies().len(), 1);
    assert_eq!(entry.dependencies()[0].module_type, Some(ModuleType::Infall));

    let infall = rt
        .register(ModuleDescriptor::new("infall", ModuleType::Infall, Plain).with_phases(PhaseSet::HALO))
        .unwrap();
    rt.initialize_module(infall).unwrap();
    rt.set_active(infall).unwrap();
    rt.set_active(id).unwrap();
    assert_eq!(rt.registry().active_id(ModuleType::Cooling), Some(id));
}
