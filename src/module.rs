//! Module identity, descriptors and the entry points a module implements
//!
//! A module is described once by a [`ModuleDescriptor`]: metadata, the
//! phases it takes part in, the functions it exposes to other modules and
//! the dependencies it needs. Behaviour lives behind the [`Module`] trait.

use crate::callback::{FunctionEntry, PhaseCall};
use crate::config::ConfigStore;
use crate::error::{Result, RuntimeError};
use crate::version::{Version, VersionRange};
use bitflags::bitflags;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

/// Per-instance state returned by [`Module::initialize`]
pub type ModuleState = Box<dyn Any>;

/// Registry-assigned module identifier
///
/// Assigned sequentially at registration and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ModuleId(pub(crate) u32);

impl ModuleId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Originator of an inter-module call
///
/// The host simulation calls in as [`Caller::Host`], which is exempt from
/// dependency validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Caller {
    Host,
    Module(ModuleId),
}

impl Caller {
    #[must_use]
    pub fn module_id(self) -> Option<ModuleId> {
        match self {
            Self::Host => None,
            Self::Module(id) => Some(id),
        }
    }
}

impl From<ModuleId> for Caller {
    fn from(id: ModuleId) -> Self {
        Self::Module(id)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Module(id) => write!(f, "{id}"),
        }
    }
}

/// Physics category of a module; at most one module per type is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ModuleType {
    Cooling,
    StarFormation,
    Feedback,
    Agn,
    Mergers,
    DiskInstability,
    Reincorporation,
    Infall,
    Misc,
}

impl ModuleType {
    pub const ALL: [ModuleType; 9] = [
        Self::Cooling,
        Self::StarFormation,
        Self::Feedback,
        Self::Agn,
        Self::Mergers,
        Self::DiskInstability,
        Self::Reincorporation,
        Self::Infall,
        Self::Misc,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooling => "cooling",
            Self::StarFormation => "star_formation",
            Self::Feedback => "feedback",
            Self::Agn => "agn",
            Self::Mergers => "mergers",
            Self::DiskInstability => "disk_instability",
            Self::Reincorporation => "reincorporation",
            Self::Infall => "infall",
            Self::Misc => "misc",
        }
    }

    /// Numeric code used by manifest files
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = RuntimeError;

    /// Accepts canonical names, upper-case and hyphenated spellings, and
    /// manifest codes
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u32>() {
            return Self::from_code(code).ok_or_else(|| {
                RuntimeError::InvalidArguments(format!("module type code {code} out of range"))
            });
        }

        let normalized = trimmed.to_ascii_lowercase().replace(['-', ' '], "_");
        let normalized = normalized.strip_prefix("module_type_").unwrap_or(&normalized);
        match normalized {
            "cooling" => Ok(Self::Cooling),
            "star_formation" | "starformation" => Ok(Self::StarFormation),
            "feedback" => Ok(Self::Feedback),
            "agn" => Ok(Self::Agn),
            "mergers" | "merger" => Ok(Self::Mergers),
            "disk_instability" | "disc_instability" => Ok(Self::DiskInstability),
            "reincorporation" => Ok(Self::Reincorporation),
            "infall" => Ok(Self::Infall),
            "misc" => Ok(Self::Misc),
            _ => Err(RuntimeError::InvalidArguments(format!(
                "unknown module type '{s}'"
            ))),
        }
    }
}

/// Stage of the per-group integration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Halo,
    Galaxy,
    Post,
    Final,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Self::Halo, Self::Galaxy, Self::Post, Self::Final];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Halo => "HALO",
            Self::Galaxy => "GALAXY",
            Self::Post => "POST",
            Self::Final => "FINAL",
        }
    }

    #[must_use]
    pub fn flag(self) -> PhaseSet {
        match self {
            Self::Halo => PhaseSet::HALO,
            Self::Galaxy => PhaseSet::GALAXY,
            Self::Post => PhaseSet::POST,
            Self::Final => PhaseSet::FINAL,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Phases a module handles; empty by default
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PhaseSet: u32 {
        const HALO = 1 << 0;
        const GALAXY = 1 << 1;
        const POST = 1 << 2;
        const FINAL = 1 << 3;
    }
}

bitflags! {
    /// Optional features advertised by a module
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const CALLBACKS = 1 << 0;
        const CONFIGURABLE = 1 << 1;
        const DYNAMIC = 1 << 2;
        const PROPERTIES = 1 << 3;
        const DIAGNOSTICS = 1 << 4;
    }
}

impl Capabilities {
    /// Parse a comma separated list of names or a decimal bitmask
    ///
    /// Unknown names are skipped.
    #[must_use]
    pub fn parse_list(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(bits) = trimmed.parse::<u32>() {
            return Self::from_bits_truncate(bits);
        }
        trimmed
            .split(',')
            .filter_map(|name| match name.trim().to_ascii_lowercase().as_str() {
                "callbacks" => Some(Self::CALLBACKS),
                "configurable" => Some(Self::CONFIGURABLE),
                "dynamic" => Some(Self::DYNAMIC),
                "properties" => Some(Self::PROPERTIES),
                "diagnostics" => Some(Self::DIAGNOSTICS),
                _ => None,
            })
            .fold(Self::empty(), |acc, flag| acc | flag)
    }
}

/// A dependency constraint on another module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDependency {
    /// Specific module; `None` means the active module of `module_type`
    pub name: Option<String>,
    /// Required type of the target; `None` only for named dependencies
    /// read from manifests, which do not state a type
    pub module_type: Option<ModuleType>,
    pub range: VersionRange,
    /// An unmet optional dependency is a warning, not a failure
    pub optional: bool,
}

impl ModuleDependency {
    /// Required dependency on whichever module of `module_type` is active
    #[must_use]
    pub fn on_type(module_type: ModuleType) -> Self {
        Self {
            name: None,
            module_type: Some(module_type),
            range: VersionRange::default(),
            optional: false,
        }
    }

    /// Required dependency on a named module of any type
    #[must_use]
    pub fn on_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            module_type: None,
            range: VersionRange::default(),
            optional: false,
        }
    }

    /// Required dependency on a named module
    #[must_use]
    pub fn on_module(name: impl Into<String>, module_type: ModuleType) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::on_type(module_type)
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn with_range(mut self, range: VersionRange) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn min_version(mut self, min: Version) -> Self {
        self.range.min = min;
        self
    }

    #[must_use]
    pub fn max_version(mut self, max: Version) -> Self {
        self.range.max = Some(max);
        self
    }

    #[must_use]
    pub fn exact(mut self) -> Self {
        self.range.exact = true;
        self
    }

    /// Human readable target, e.g. `cooling` or `sage_cooling (cooling)`
    #[must_use]
    pub fn target_label(&self) -> String {
        match (&self.name, self.module_type) {
            (Some(name), Some(ty)) => format!("{name} ({ty})"),
            (Some(name), None) => name.clone(),
            (None, Some(ty)) => ty.to_string(),
            (None, None) => "<unspecified>".to_string(),
        }
    }

    /// Whether this dependency covers calls into `name` of type `module_type`
    #[must_use]
    pub fn covers(&self, name: &str, module_type: ModuleType) -> bool {
        match &self.name {
            Some(dep_name) => dep_name == name,
            None => self.module_type == Some(module_type),
        }
    }
}

/// Entry points of a pluggable module
///
/// Only `initialize` is mandatory; the rest default to no-ops, except
/// `configure` which rejects every key.
pub trait Module {
    /// Build the module's per-instance state
    fn initialize(&self, config: &dyn ConfigStore) -> Result<ModuleState>;

    /// Release the state produced by `initialize`
    fn cleanup(&self, state: ModuleState) -> Result<()> {
        drop(state);
        Ok(())
    }

    /// Change a runtime parameter
    fn configure(&self, state: &mut dyn Any, key: &str, value: &str) -> Result<()> {
        let _ = (state, value);
        Err(RuntimeError::OperationFailed(format!(
            "module does not accept parameter '{key}'"
        )))
    }

    /// Run this module's handler for `call.phase`
    fn execute_phase(&self, call: &mut PhaseCall<'_>) -> Result<()> {
        let _ = call;
        Ok(())
    }
}

/// Immutable description of a module, built once and handed to the registry
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub module_type: ModuleType,
    pub capabilities: Capabilities,
    pub phases: PhaseSet,
    pub dependencies: Vec<ModuleDependency>,
    pub functions: Vec<FunctionEntry>,
    pub implementation: Rc<dyn Module>,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        module_type: ModuleType,
        implementation: impl Module + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            version: Version::new(1, 0, 0),
            author: String::new(),
            description: String::new(),
            module_type,
            capabilities: Capabilities::empty(),
            phases: PhaseSet::empty(),
            dependencies: Vec::new(),
            functions: Vec::new(),
            implementation: Rc::new(implementation),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities |= capabilities;
        self
    }

    #[must_use]
    pub fn with_phases(mut self, phases: PhaseSet) -> Self {
        self.phases |= phases;
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: ModuleDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Expose a function to other modules; implies [`Capabilities::CALLBACKS`]
    #[must_use]
    pub fn with_function(mut self, entry: FunctionEntry) -> Self {
        self.capabilities |= Capabilities::CALLBACKS;
        self.functions.push(entry);
        self
    }

    #[must_use]
    pub fn handles(&self, phase: Phase) -> bool {
        self.phases.contains(phase.flag())
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("module_type", &self.module_type)
            .field("capabilities", &self.capabilities)
            .field("phases", &self.phases)
            .field("dependencies", &self.dependencies)
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl Module for Inert {
        fn initialize(&self, _config: &dyn ConfigStore) -> Result<ModuleState> {
            Ok(Box::new(()))
        }
    }

    #[test]
    fn test_module_type_parsing() {
        assert_eq!("cooling".parse::<ModuleType>().unwrap(), ModuleType::Cooling);
        assert_eq!(
            "STAR-FORMATION".parse::<ModuleType>().unwrap(),
            ModuleType::StarFormation
        );
        assert_eq!(
            "MODULE_TYPE_MERGERS".parse::<ModuleType>().unwrap(),
            ModuleType::Mergers
        );
        assert_eq!("7".parse::<ModuleType>().unwrap(), ModuleType::Infall);
        assert!("9".parse::<ModuleType>().is_err());
        assert!("heating".parse::<ModuleType>().is_err());
    }

    #[test]
    fn test_module_type_codes_round_trip() {
        for ty in ModuleType::ALL {
            assert_eq!(ModuleType::from_code(ty.code()), Some(ty));
        }
    }

    #[test]
    fn test_capabilities_parse() {
        let caps = Capabilities::parse_list("callbacks, configurable, bogus");
        assert_eq!(caps, Capabilities::CALLBACKS | Capabilities::CONFIGURABLE);
        assert_eq!(Capabilities::parse_list("4"), Capabilities::DYNAMIC);
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ModuleDescriptor::new("inert", ModuleType::Misc, Inert)
            .with_version(Version::new(2, 1, 0))
            .with_phases(PhaseSet::GALAXY | PhaseSet::POST)
            .with_dependency(ModuleDependency::on_type(ModuleType::Cooling).optional());

        assert!(descriptor.handles(Phase::Galaxy));
        assert!(!descriptor.handles(Phase::Halo));
        assert_eq!(descriptor.dependencies.len(), 1);
        assert!(descriptor.dependencies[0].optional);
    }

    #[test]
    fn test_phases_opt_in() {
        assert!(PhaseSet::default().is_empty());
        let descriptor = ModuleDescriptor::new("inert", ModuleType::Misc, Inert);
        assert_eq!(descriptor.phases, PhaseSet::default());
        for phase in Phase::ALL {
            assert!(!descriptor.handles(phase));
        }
    }

    #[test]
    fn test_default_configure_rejects() {
        let mut state: ModuleState = Box::new(());
        let err = Inert.configure(state.as_mut(), "rate", "1.0").unwrap_err();
        assert!(err.to_string().contains("rate"));
    }

    #[test]
    fn test_caller_display() {
        assert_eq!(Caller::Host.to_string(), "host");
        assert_eq!(Caller::from(ModuleId(3)).to_string(), "#3");
    }
}
