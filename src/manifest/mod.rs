//! # Container Manifest
//!
//! Typed, validated description of a container: what it runs, what it
//! may consume, and what the sandbox must enforce. A manifest is parsed
//! once at install time and treated as immutable thereafter; the
//! sandbox compiler re-validates it against the running kernel before
//! each start.
//!
//! ## Validation
//!
//! [`Manifest::parse`] is pure and fails fast: the first violation is
//! reported as a structured [`Error::ManifestInvalid`], nothing is
//! accumulated. Checked invariants:
//!
//! - name and version are well formed (enforced by the identity types)
//! - mount targets are absolute, normalized and unique
//! - resource mounts reference a concrete name and version
//! - capability names belong to the supported set (serde-enforced)
//! - rlimit pairs satisfy soft ≤ hard
//!
//! ## Resource Containers
//!
//! A manifest without `init` describes a resource container: a bundle
//! of read-only content other containers mount via
//! [`Mount::Resource`]. Resource containers cannot be started.
//!
//! [`Error::ManifestInvalid`]: crate::error::Error::ManifestInvalid

pub mod mount;
pub mod resources;

pub use mount::{Bind, Mount, MountOption, Resource, Tmpfs};
pub use resources::{
    BlkIoResources, Capability, CpuResources, MemoryResources, RLimitResource, RLimitValue,
    ThrottleDevice,
};

use crate::container::{Container, Name, Version};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

// =============================================================================
// Manifest
// =============================================================================

/// Per-container configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application name.
    pub name: Name,
    /// Application version.
    pub version: Version,
    /// Path to the init binary inside the container root.
    ///
    /// `None` marks a resource container which only provides content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<PathBuf>,
    /// Arguments passed to init.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// User id the process runs as.
    #[serde(default)]
    pub uid: u32,
    /// Group id the process runs as.
    #[serde(default)]
    pub gid: u32,
    /// CPU limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// Block I/O limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blkio: Option<BlkIoResources>,
    /// Mount table, keyed by absolute target path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mounts: BTreeMap<PathBuf, Mount>,
    /// Capability allow-list. Default: empty (deny all).
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub capabilities: HashSet<Capability>,
    /// Rlimit table.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rlimits: HashMap<RLimitResource, RLimitValue>,
    /// Seccomp configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<Seccomp>,
    /// Optional SELinux label applied to the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux: Option<Selinux>,
    /// Console access policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsolePolicy>,
    /// Autostart behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart: Option<Autostart>,
    /// Stdio/log routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io: Option<Io>,
}

impl Manifest {
    /// Parses and validates a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestInvalid`] describing the first
    /// violation encountered.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| Error::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serializes the manifest to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns the container key declared by this manifest.
    pub fn container(&self) -> Container {
        Container::new(self.name.clone(), self.version)
    }

    /// Returns true if this manifest describes a resource container.
    pub fn is_resource(&self) -> bool {
        self.init.is_none()
    }

    /// Iterates the resource containers referenced by the mount table.
    pub fn resource_mounts(&self) -> impl Iterator<Item = &Resource> {
        self.mounts.values().filter_map(|mount| match mount {
            Mount::Resource(resource) => Some(resource),
            _ => None,
        })
    }

    /// Validates the manifest invariants.
    ///
    /// Pure and side-effect free; fails fast on the first violation.
    pub fn validate(&self) -> Result<()> {
        // Mount targets: absolute and normalized. Duplicate targets
        // cannot exist: the map key compares by path components, so
        // "/data" and "/data/" land on the same entry, and the
        // trailing-slash spelling is rejected here.
        for (target, mount) in &self.mounts {
            if !target.is_absolute() {
                return Err(Error::ManifestInvalid(format!(
                    "mount target '{}' is not absolute",
                    target.display()
                )));
            }
            let trailing_slash = target.as_os_str().to_string_lossy().ends_with('/')
                && target != Path::new("/");
            if trailing_slash
                || target
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
            {
                return Err(Error::ManifestInvalid(format!(
                    "mount target '{}' is not normalized",
                    target.display()
                )));
            }

            if let Mount::Resource(resource) = mount {
                if !resource.dir.is_absolute() {
                    return Err(Error::ManifestInvalid(format!(
                        "resource dir '{}' for target '{}' is not absolute",
                        resource.dir.display(),
                        target.display()
                    )));
                }
            }
            if let Mount::Tmpfs(tmpfs) = mount {
                if tmpfs.size == 0 {
                    return Err(Error::ManifestInvalid(format!(
                        "tmpfs at '{}' has zero size",
                        target.display()
                    )));
                }
            }
        }

        // Rlimits: soft ≤ hard when both present.
        for (resource, value) in &self.rlimits {
            if let (Some(soft), Some(hard)) = (value.soft, value.hard) {
                if soft > hard {
                    return Err(Error::ManifestInvalid(format!(
                        "rlimit {resource:?}: soft {soft} exceeds hard {hard}"
                    )));
                }
            }
        }

        // Resource containers provide content only.
        if self.is_resource() {
            if self.autostart.is_some() {
                return Err(Error::ManifestInvalid(
                    "resource container cannot be autostarted".to_string(),
                ));
            }
            if !self.args.is_empty() {
                return Err(Error::ManifestInvalid(
                    "resource container cannot declare args".to_string(),
                ));
            }
        }

        if let Some(seccomp) = &self.seccomp {
            seccomp.validate()?;
        }

        Ok(())
    }
}

// =============================================================================
// Seccomp
// =============================================================================

/// Seccomp configuration of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seccomp {
    /// Named base profile providing a default syscall set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    /// Explicit allow rules merged on top of the profile.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allow: BTreeMap<String, SyscallRule>,
    /// Action taken for syscalls outside the allow-list.
    #[serde(default)]
    pub deny: DenyAction,
}

impl Seccomp {
    fn validate(&self) -> Result<()> {
        if self.profile.is_none() && self.allow.is_empty() {
            return Err(Error::ManifestInvalid(
                "seccomp section with neither profile nor allow rules".to_string(),
            ));
        }
        for (syscall, rule) in &self.allow {
            if syscall.is_empty() {
                return Err(Error::ManifestInvalid(
                    "seccomp rule with empty syscall name".to_string(),
                ));
            }
            if let SyscallRule::Args(rules) = rule {
                if rules.is_empty() {
                    return Err(Error::ManifestInvalid(format!(
                        "seccomp rule for '{syscall}' has no argument constraints"
                    )));
                }
                for arg in rules {
                    if arg.index > 5 {
                        return Err(Error::ManifestInvalid(format!(
                            "seccomp rule for '{syscall}' argument index {} out of range",
                            arg.index
                        )));
                    }
                    if arg.values.is_empty() {
                        return Err(Error::ManifestInvalid(format!(
                            "seccomp rule for '{syscall}' constrains no values"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Named seccomp presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Baseline syscall set sufficient for ordinary applications.
    Default,
}

/// Allow rule for one syscall.
///
/// On the wire either the string `"any"` or a list of argument
/// constraints. Constraints on different indices must all hold;
/// multiple constraints on the same index are unioned, unless their
/// masks differ, which is a compile error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyscallRule {
    /// Any argument values are permitted.
    Any(Any),
    /// Only specific argument values are permitted.
    Args(Vec<SyscallArgRule>),
}

/// Marker for an unconditional allow rule (`"any"` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Any {
    Any,
}

/// Constraint on one syscall argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallArgRule {
    /// Argument index (0..=5).
    pub index: usize,
    /// Permitted values (after masking).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<u64>,
    /// Optional bitmask applied before comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,
}

/// Action for syscalls that are not allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyAction {
    /// Kill the offending process.
    #[default]
    Kill,
    /// Fail the syscall with EPERM and continue.
    Errno,
}

/// SELinux process label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selinux {
    /// Security context, e.g. `system_u:system_r:container_t:s0`.
    pub context: String,
}

// =============================================================================
// Console / Autostart / Io
// =============================================================================

/// Console access permissions of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolePolicy {
    /// Requests this container's console connection may issue.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub permissions: HashSet<ConsolePermission>,
}

/// Individual console permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolePermission {
    /// Query the container list.
    List,
    /// Install and uninstall containers.
    Install,
    /// Mount and umount containers.
    Mount,
    /// Start and stop containers.
    Start,
    /// Shut the runtime down.
    Shutdown,
}

/// Autostart declaration.
///
/// Autostarted containers are launched during engine initialization,
/// ordered by `order` (ties broken by container key). A failure to
/// start one container never blocks the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Autostart {
    /// Launch order, lowest first.
    #[serde(default)]
    pub order: u32,
}

/// Stdio and log routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Io {
    /// Where stdout goes.
    #[serde(default)]
    pub stdout: Output,
    /// Where stderr goes.
    #[serde(default)]
    pub stderr: Output,
}

/// Output routing target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    /// Discard.
    #[default]
    Discard,
    /// Forward into the runtime log.
    Log,
    /// Inherit the runtime's own stdio.
    Inherit,
}
