//! Module manifest files
//!
//! A manifest is a line-oriented `key: value` file next to a module
//! library:
//!
//! ```text
//! name: standard_cooling
//! version: 1.2.0
//! type: cooling
//! library: libstandard_cooling.so
//! auto_activate: true
//! dependency.0: infall: 1.0.0
//! dependency.1: agn[optional]: 1.0.0: 2.0.0
//! ```
//!
//! Unknown keys are ignored. `name`, `version`, `type` and `library` are
//! required.

use super::loader::MODULE_API_VERSION;
use crate::error::{Result, RuntimeError};
use crate::module::{Capabilities, ModuleDependency, ModuleType};
use crate::version::Version;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File extension of manifest files in module search paths
pub const MANIFEST_EXTENSION: &str = "manifest";

static DEPENDENCY_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dependency\.(\d+)$").expect("valid dependency key pattern"));

static DEPENDENCY_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)\s*(?:\[([A-Za-z,\s]*)\])?$")
        .expect("valid dependency target pattern")
});

/// Parsed manifest
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub module_type: ModuleType,
    /// Library path as written in the manifest
    pub library: PathBuf,
    pub api_version: u32,
    pub auto_initialize: bool,
    pub auto_activate: bool,
    pub capabilities: Capabilities,
    /// Dependencies in `dependency.N` order
    pub dependencies: Vec<ModuleDependency>,
    /// File the manifest was read from
    pub source: PathBuf,
}

impl Manifest {
    /// Read and parse a manifest file
    ///
    /// # Errors
    /// `InvalidManifest` if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RuntimeError::invalid_manifest(path.display().to_string(), e.to_string())
        })?;
        Self::parse(&text, path)
    }

    /// Parse manifest text; `source` is used for messages and to resolve a
    /// relative library path
    ///
    /// # Errors
    /// `InvalidManifest` when a required key is missing or `name`,
    /// `version` or `type` has an unusable value.
    pub fn parse(text: &str, source: &Path) -> Result<Self> {
        let origin = source.display().to_string();
        let invalid = |reason: String| RuntimeError::invalid_manifest(origin.clone(), reason);

        let mut name = None;
        let mut version = None;
        let mut module_type = None;
        let mut library = None;
        let mut author = String::new();
        let mut description = String::new();
        let mut api_version = MODULE_API_VERSION;
        let mut auto_initialize = false;
        let mut auto_activate = false;
        let mut capabilities = Capabilities::empty();
        let mut dependencies: Vec<(u32, ModuleDependency)> = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                warn!("{}:{}: ignoring line without ':'", origin, line_no + 1);
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "name" => name = Some(value.to_string()),
                "version" => {
                    version = Some(
                        Version::parse(value)
                            .map_err(|e| invalid(format!("bad version '{value}': {e}")))?,
                    );
                }
                "author" => author = value.to_string(),
                "description" => description = value.to_string(),
                "type" => {
                    module_type = Some(
                        value
                            .parse::<ModuleType>()
                            .map_err(|_| invalid(format!("invalid module type '{value}'")))?,
                    );
                }
                "library" => library = Some(PathBuf::from(value)),
                "api_version" => match value.parse() {
                    Ok(v) => api_version = v,
                    Err(_) => warn!("{}: ignoring bad api_version '{}'", origin, value),
                },
                "auto_initialize" => auto_initialize = parse_flag(value),
                "auto_activate" => auto_activate = parse_flag(value),
                "capabilities" => capabilities = Capabilities::parse_list(value),
                _ => {
                    if let Some(caps) = DEPENDENCY_KEY.captures(key) {
                        let index = caps[1].parse().unwrap_or(u32::MAX);
                        match parse_dependency(value) {
                            Ok(dep) => dependencies.push((index, dep)),
                            Err(reason) => warn!(
                                "{}:{}: skipping malformed dependency '{}': {}",
                                origin,
                                line_no + 1,
                                value,
                                reason
                            ),
                        }
                    } else {
                        debug!("{}: ignoring unknown key '{}'", origin, key);
                    }
                }
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("missing 'name'".to_string()))?;
        let version = version.ok_or_else(|| invalid("missing 'version'".to_string()))?;
        let module_type = module_type.ok_or_else(|| invalid("missing 'type'".to_string()))?;
        let library = library
            .filter(|l| !l.as_os_str().is_empty())
            .ok_or_else(|| invalid("missing 'library'".to_string()))?;

        dependencies.sort_by_key(|(index, _)| *index);

        Ok(Self {
            name,
            version,
            author,
            description,
            module_type,
            library,
            api_version,
            auto_initialize,
            auto_activate,
            capabilities,
            dependencies: dependencies.into_iter().map(|(_, dep)| dep).collect(),
            source: source.to_path_buf(),
        })
    }

    /// Library path, relative paths resolved against the manifest directory
    #[must_use]
    pub fn library_path(&self) -> PathBuf {
        if self.library.is_absolute() {
            return self.library.clone();
        }
        match self.source.parent() {
            Some(dir) => dir.join(&self.library),
            None => self.library.clone(),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// `target[flags]: min_version[: max_version]`
///
/// A target that names a module type depends on the active module of that
/// type; any other target is a module name.
fn parse_dependency(value: &str) -> std::result::Result<ModuleDependency, String> {
    let mut parts = value.split(':').map(str::trim);
    let target = parts.next().unwrap_or_default();
    let min = parts.next().ok_or("missing minimum version")?;
    let max = parts.next();
    if parts.next().is_some() {
        return Err("too many ':' separated fields".to_string());
    }

    let caps = DEPENDENCY_TARGET
        .captures(target)
        .ok_or_else(|| format!("invalid target '{target}'"))?;
    let target_name = &caps[1];

    let mut dependency = match target_name.parse::<ModuleType>() {
        Ok(ty) if target_name.parse::<u32>().is_err() => ModuleDependency::on_type(ty),
        _ => ModuleDependency::on_name(target_name),
    };

    if let Some(flags) = caps.get(2) {
        for flag in flags.as_str().split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "optional" => dependency.optional = true,
                "exact" => dependency.range.exact = true,
                other => warn!("Ignoring unknown dependency flag '{}'", other),
            }
        }
    }

    dependency.range.min = Version::parse(min).map_err(|e| e.to_string())?;
    if let Some(max) = max.filter(|m| !m.is_empty()) {
        dependency.range.max = Some(Version::parse(max).map_err(|e| e.to_string())?);
    }
    Ok(dependency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse(text: &str) -> Result<Manifest> {
        Manifest::parse(text, Path::new("/opt/modules/test.manifest"))
    }

    const FULL: &str = "\
# cooling module
name: standard_cooling
version: 1.2.0
author: SAGE team
description: Standard cooling: with colons
type: cooling
library: libstandard_cooling.so
api_version: 1
auto_initialize: yes
auto_activate: true
capabilities: callbacks, configurable
dependency.1: agn[optional]: 1.0.0: 2.0.0
dependency.0: infall: 1.0.0
dependency.2: helper_lib[exact]: 0.3.1
future_key: whatever
";

    #[test]
    fn test_parse_full_manifest() {
        let m = parse(FULL).unwrap();
        assert_eq!(m.name, "standard_cooling");
        assert_eq!(m.version, Version::new(1, 2, 0));
        assert_eq!(m.description, "Standard cooling: with colons");
        assert_eq!(m.module_type, ModuleType::Cooling);
        assert!(m.auto_initialize);
        assert!(m.auto_activate);
        assert_eq!(m.capabilities, Capabilities::CALLBACKS | Capabilities::CONFIGURABLE);
        assert_eq!(
            m.library_path(),
            PathBuf::from("/opt/modules/libstandard_cooling.so")
        );

        assert_eq!(m.dependencies.len(), 3);
        assert_eq!(m.dependencies[0].module_type, Some(ModuleType::Infall));
        assert!(!m.dependencies[0].optional);
        assert_eq!(m.dependencies[1].module_type, Some(ModuleType::Agn));
        assert!(m.dependencies[1].optional);
        assert_eq!(m.dependencies[1].range.max, Some(Version::new(2, 0, 0)));
        assert_eq!(m.dependencies[2].name.as_deref(), Some("helper_lib"));
        assert!(m.dependencies[2].range.exact);
    }

    #[test]
    fn test_missing_required_fields() {
        for missing in ["name", "version", "type", "library"] {
            let text: String = FULL
                .lines()
                .filter(|l| !l.starts_with(&format!("{missing}:")))
                .map(|l| format!("{l}\n"))
                .collect();
            let err = parse(&text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidManifest, "missing {missing}");
        }
    }

    #[test]
    fn test_type_out_of_range() {
        let err = parse("name: x\nversion: 1.0\ntype: 12\nlibrary: x.so\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifest);
        let ok = parse("name: x\nversion: 1.0\ntype: 8\nlibrary: x.so\n").unwrap();
        assert_eq!(ok.module_type, ModuleType::Misc);
    }

    #[test]
    fn test_malformed_dependency_skipped() {
        let m = parse(
            "name: x\nversion: 1.0\ntype: misc\nlibrary: /abs/x.so\n\
             dependency.0: cooling\ndependency.1: cooling: one.two\ndependency.2: infall: 1.0\n",
        )
        .unwrap();
        assert_eq!(m.dependencies.len(), 1);
        assert_eq!(m.dependencies[0].module_type, Some(ModuleType::Infall));
        assert_eq!(m.library_path(), PathBuf::from("/abs/x.so"));
    }

    #[test]
    fn test_defaults() {
        let m = parse("name: x\nversion: 2\ntype: feedback\nlibrary: x.so\n").unwrap();
        assert_eq!(m.api_version, MODULE_API_VERSION);
        assert!(!m.auto_initialize);
        assert!(!m.auto_activate);
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.manifest");
        std::fs::write(&path, FULL).unwrap();
        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.source, path);
        assert_eq!(m.library_path(), dir.path().join("libstandard_cooling.so"));

        let err = Manifest::load(&dir.path().join("absent.manifest")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    }
}
