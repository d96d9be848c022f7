//! Semantic version parsing and range checks

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` version
///
/// Ordering is lexicographic on `(major, minor, patch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string
    ///
    /// Missing trailing components default to zero, so `"2"` and `"2.0"`
    /// both parse as `2.0.0`. Anything after a `-` or `+` (pre-release or
    /// build metadata) is ignored.
    ///
    /// # Errors
    /// Returns `InvalidArguments` for empty input, more than three
    /// components, or a non-numeric component.
    pub fn parse(text: &str) -> Result<Self> {
        let core = text
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Err(RuntimeError::InvalidArguments(format!(
                "empty version string '{text}'"
            )));
        }

        let mut parts = [0u32; 3];
        for (idx, component) in core.split('.').enumerate() {
            if idx >= parts.len() {
                return Err(RuntimeError::InvalidArguments(format!(
                    "too many components in version '{text}'"
                )));
            }
            parts[idx] = component.parse().map_err(|_| {
                RuntimeError::InvalidArguments(format!(
                    "invalid component '{component}' in version '{text}'"
                ))
            })?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    /// Whether `self` can stand in for `required`
    ///
    /// Same major version and not older than `required`.
    #[must_use]
    pub fn is_compatible_with(&self, required: &Version) -> bool {
        self.major == required.major && self >= required
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Accepted versions of a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRange {
    pub min: Version,
    pub max: Option<Version>,
    /// Require equality with `min` instead of a range check
    pub exact: bool,
}

impl VersionRange {
    #[must_use]
    pub fn at_least(min: Version) -> Self {
        Self {
            min,
            max: None,
            exact: false,
        }
    }

    #[must_use]
    pub fn between(min: Version, max: Version) -> Self {
        Self {
            min,
            max: Some(max),
            exact: false,
        }
    }

    #[must_use]
    pub fn exactly(version: Version) -> Self {
        Self {
            min: version,
            max: None,
            exact: true,
        }
    }

    /// Check `version` against the range; both bounds are inclusive
    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        if self.exact {
            return *version == self.min;
        }
        if *version < self.min {
            return false;
        }
        self.max.map_or(true, |max| *version <= max)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exact {
            return write!(f, "={}", self.min);
        }
        match self.max {
            Some(max) => write!(f, ">={}, <={}", self.min, max),
            None => write!(f, ">={}", self.min),
        }
    }
}
