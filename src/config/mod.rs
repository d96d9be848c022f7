//! Configuration store and runtime limits
//!
//! Configuration is a tree of values addressed by dot-separated paths
//! (`runtime.max_call_depth`, `pipeline.steps.0.type`). Files may be YAML or
//! JSON; both are loaded into the same [`ValueStore`].

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Typed, path-addressed read access to configuration values
///
/// Getters never fail: a missing or mistyped value yields `default`.
pub trait ConfigStore {
    fn get_bool(&self, path: &str, default: bool) -> bool;
    fn get_int(&self, path: &str, default: i64) -> i64;
    fn get_double(&self, path: &str, default: f64) -> f64;
    fn get_string(&self, path: &str, default: &str) -> String;

    /// Number of elements of the array at `path`, zero if absent
    fn get_array_size(&self, path: &str) -> usize;

    /// Sub-store rooted at element `index` of the array at `path`
    fn get_array_element(&self, path: &str, index: usize) -> Option<Box<dyn ConfigStore>>;

    fn has_key(&self, path: &str) -> bool;
}

/// [`ConfigStore`] backed by a `serde_json::Value` tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueStore {
    root: Value,
}

impl ValueStore {
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Store with no keys; every getter returns its default
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// Parse YAML configuration text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text).context("Failed to parse YAML config")?;
        Ok(Self::new(root))
    }

    /// Parse JSON configuration text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text).context("Failed to parse JSON config")?;
        Ok(Self::new(root))
    }

    /// Load configuration from a file, JSON if the extension is `.json`,
    /// YAML otherwise
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(&self.root);
        }
        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl ConfigStore for ValueStore {
    fn get_bool(&self, path: &str, default: bool) -> bool {
        match self.lookup(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map_or(default, |v| v != 0.0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }

    fn get_int(&self, path: &str, default: i64) -> i64 {
        match self.lookup(path) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|v| v as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => default,
        }
    }

    fn get_double(&self, path: &str, default: f64) -> f64 {
        match self.lookup(path) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_string(&self, path: &str, default: &str) -> String {
        match self.lookup(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    fn get_array_size(&self, path: &str) -> usize {
        match self.lookup(path) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        }
    }

    fn get_array_element(&self, path: &str, index: usize) -> Option<Box<dyn ConfigStore>> {
        match self.lookup(path) {
            Some(Value::Array(items)) => items
                .get(index)
                .map(|item| Box::new(ValueStore::new(item.clone())) as Box<dyn ConfigStore>),
            _ => None,
        }
    }

    fn has_key(&self, path: &str) -> bool {
        !matches!(self.lookup(path), None | Some(Value::Null))
    }
}

/// Capacity policies of the runtime
///
/// Every bounded structure in the runtime takes its bound from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub max_modules: usize,
    pub max_functions_per_module: usize,
    pub max_dependencies_per_module: usize,
    pub max_call_depth: usize,
    pub max_pipeline_steps: usize,
    /// Maximum entities per host group, and so the merger queue size
    pub merger_queue_capacity: usize,
    pub error_history_capacity: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_modules: 64,
            max_functions_per_module: 32,
            max_dependencies_per_module: 16,
            max_call_depth: 32,
            max_pipeline_steps: 32,
            merger_queue_capacity: 1024,
            error_history_capacity: 16,
        }
    }
}

impl RuntimeLimits {
    /// Read limits from `runtime.*`, falling back to defaults
    ///
    /// Non-positive values are ignored.
    #[must_use]
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: usize| -> usize {
            let value = store.get_int(&format!("runtime.{key}"), fallback as i64);
            usize::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };

        Self {
            max_modules: read("max_modules", defaults.max_modules),
            max_functions_per_module: read(
                "max_functions_per_module",
                defaults.max_functions_per_module,
            ),
            max_dependencies_per_module: read(
                "max_dependencies_per_module",
                defaults.max_dependencies_per_module,
            ),
            max_call_depth: read("max_call_depth", defaults.max_call_depth),
            max_pipeline_steps: read("max_pipeline_steps", defaults.max_pipeline_steps),
            merger_queue_capacity: read("merger_queue_capacity", defaults.merger_queue_capacity),
            error_history_capacity: read(
                "error_history_capacity",
                defaults.error_history_capacity,
            ),
        }
    }
}

/// Default per-user module directory (`~/.galaxy-runtime/modules`)
#[must_use]
pub fn default_module_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".galaxy-runtime").join("modules"))
}

/// Module search paths: `modules.search_paths` followed by the default
/// per-user directory
#[must_use]
pub fn module_search_paths(store: &dyn ConfigStore) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = (0..store.get_array_size("modules.search_paths"))
        .map(|idx| store.get_string(&format!("modules.search_paths.{idx}"), ""))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();

    if let Some(default_dir) = default_module_dir() {
        if !paths.contains(&default_dir) {
            paths.push(default_dir);
        }
    }
    paths
}
