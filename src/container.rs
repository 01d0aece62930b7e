//! Container identity types.
//!
//! A container is uniquely identified by its name and version. Both are
//! validated at construction and immutable afterwards; [`Container`] is
//! the map key throughout the engine.

use crate::constants::validate_name;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Name
// =============================================================================

/// Validated application name.
///
/// Non-empty, NUL-free, bounded length, path-safe character set (see
/// [`crate::constants::NAME_VALID_CHARS`]). Equality and hashing are by
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Name {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        validate_name(&s).map_err(|reason| Error::InvalidName {
            name: s.clone(),
            reason: reason.to_string(),
        })?;
        Ok(Self(s))
    }
}

impl TryFrom<&str> for Name {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Error> {
        Self::try_from(s.to_string())
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Version
// =============================================================================

/// Semantic version triple with total ordering.
///
/// Ordering is lexicographic over `(major, minor, patch)` and is used
/// for upgrade/downgrade decisions and resource container matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Creates a new version.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidVersion(s.to_string()))
        };
        let version = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(Error::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// Container
// =============================================================================

/// Unique key of a container instance: name plus version.
///
/// Formatted as `name:version`. Cheap to clone and used as the map key
/// of the engine's state table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Container {
    name: Name,
    version: Version,
}

impl Container {
    /// Creates a new container key.
    pub fn new(name: Name, version: Version) -> Self {
        Self { name, version }
    }

    /// Returns the container name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Returns the container version.
    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl TryFrom<&str> for Container {
    type Error = Error;

    /// Parses `name:version`, e.g. `hello:0.1.2`.
    fn try_from(s: &str) -> Result<Self, Error> {
        let (name, version) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidName {
                name: s.to_string(),
                reason: "expected name:version".to_string(),
            })?;
        Ok(Self {
            name: Name::try_from(name)?,
            version: version.parse()?,
        })
    }
}
