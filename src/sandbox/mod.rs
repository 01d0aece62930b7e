//! # Sandbox Compiler
//!
//! Turns a validated manifest plus the kernel inventory into a
//! [`SandboxSpec`]: the complete, immutable set of kernel directives
//! for one container start. Compilation is pure; nothing touches the
//! kernel until a launcher applies the spec.
//!
//! ## Security Model
//!
//! Deny by default, everywhere:
//!
//! - capabilities: only what the manifest lists survives in the
//!   bounding set, and every listed capability must exist on the
//!   running kernel
//! - seccomp: syscalls outside the compiled allow-list hit the deny
//!   action
//! - resources: limits compile to cgroup writes or fail; they are
//!   never silently dropped
//!
//! A spec that cannot be fully compiled must not launch a process. The
//! engine guarantees a compile failure leaves the container state
//! untouched.

pub mod cgroups;
pub mod seccomp;

pub use cgroups::{CgroupAssignment, CgroupSpec};
pub use seccomp::{AllowList, FilterProgram};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::manifest::{Capability, Manifest, RLimitResource, RLimitValue};
use crate::platform::KernelInventory;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Compiled sandbox directives for one container start.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub container: Container,
    /// Compiled seccomp filter, absent if the manifest has no seccomp
    /// section.
    pub seccomp: Option<FilterProgram>,
    /// Cgroup controller assignments.
    pub cgroups: CgroupSpec,
    /// Capability bounding set. Everything else is dropped.
    pub capabilities: BTreeSet<Capability>,
    /// Rlimit soft/hard pairs.
    pub rlimits: HashMap<RLimitResource, RLimitValue>,
    /// SELinux context for the process, if any.
    pub selinux: Option<String>,
}

/// Compiles a manifest into a sandbox spec.
///
/// # Errors
///
/// Any error leaves no side effects: [`Error::UnsupportedCapability`]
/// for capabilities the kernel lacks, [`Error::SeccompConflict`] and
/// [`Error::UnknownSyscall`] from filter compilation,
/// [`Error::Sandbox`] for missing kernel features.
pub fn compile(manifest: &Manifest, inventory: &KernelInventory) -> Result<SandboxSpec> {
    let container = manifest.container();

    let mut capabilities = BTreeSet::new();
    for capability in &manifest.capabilities {
        if !inventory.supports_capability(*capability) {
            return Err(Error::UnsupportedCapability(capability.to_string()));
        }
        capabilities.insert(*capability);
    }

    let seccomp = manifest
        .seccomp
        .as_ref()
        .map(|section| seccomp::compile(section, inventory))
        .transpose()?;

    let cgroups = cgroups::compile(manifest, inventory)?;

    debug!(
        "compiled sandbox for {container}: {} seccomp instructions, {} cgroup assignments, {} capabilities",
        seccomp.as_ref().map(FilterProgram::len).unwrap_or(0),
        cgroups.assignments.len(),
        capabilities.len()
    );

    Ok(SandboxSpec {
        container,
        seccomp,
        cgroups,
        capabilities,
        rlimits: manifest.rlimits.clone(),
        selinux: manifest.selinux.as_ref().map(|s| s.context.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Name, Version};

    fn minimal(name: &str) -> Manifest {
        Manifest {
            name: Name::try_from(name).unwrap(),
            version: Version::new(1, 0, 0),
            init: Some("/init".into()),
            args: Vec::new(),
            env: Default::default(),
            uid: 1000,
            gid: 1000,
            cpu: None,
            memory: None,
            blkio: None,
            mounts: Default::default(),
            capabilities: Default::default(),
            rlimits: Default::default(),
            seccomp: None,
            selinux: None,
            console: None,
            autostart: None,
            io: None,
        }
    }

    #[test]
    fn test_compile_minimal() {
        let spec = compile(&minimal("app"), &KernelInventory::all()).unwrap();
        assert!(spec.seccomp.is_none());
        assert!(spec.cgroups.assignments.is_empty());
        assert!(spec.capabilities.is_empty());
    }

    #[test]
    fn test_unsupported_capability_is_error() {
        let mut manifest = minimal("app");
        manifest.capabilities.insert(Capability::CAP_NET_ADMIN);
        let mut inventory = KernelInventory::all();
        inventory.capabilities.remove(&Capability::CAP_NET_ADMIN);
        assert!(matches!(
            compile(&manifest, &inventory),
            Err(Error::UnsupportedCapability(_))
        ));
    }

    #[test]
    fn test_capability_allow_list_passes_through() {
        let mut manifest = minimal("app");
        manifest.capabilities.insert(Capability::CAP_KILL);
        manifest
            .capabilities
            .insert(Capability::CAP_NET_BIND_SERVICE);
        let spec = compile(&manifest, &KernelInventory::all()).unwrap();
        assert_eq!(spec.capabilities.len(), 2);
        assert!(spec.capabilities.contains(&Capability::CAP_KILL));
    }
}
