//! # Kernel Capability Inventory
//!
//! Probes what the running kernel can enforce before any sandbox is
//! compiled. The sandbox compiler is a pure function of a manifest plus
//! this inventory; probing once at engine start keeps per-start
//! compilation free of filesystem access.
//!
//! Probes used on Linux:
//!
//! - `/proc/sys/kernel/seccomp/actions_avail` for seccomp support and
//!   the set of available filter actions
//! - `/sys/fs/cgroup/cgroup.controllers` for cgroup v2 and its
//!   controllers
//! - `/proc/sys/kernel/cap_last_cap` for the highest capability number
//!
//! On non-Linux hosts the inventory is empty; sandbox compilation then
//! rejects anything that would need kernel enforcement.

use crate::manifest::Capability;
use std::collections::HashSet;
use tracing::debug;

/// Seccomp filter actions the kernel offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeccompAction {
    KillProcess,
    KillThread,
    Errno,
    Allow,
}

/// What the running kernel can enforce.
#[derive(Debug, Clone)]
pub struct KernelInventory {
    /// Seccomp filters can be installed.
    pub seccomp: bool,
    /// Seccomp actions the kernel advertises.
    pub seccomp_actions: HashSet<SeccompAction>,
    /// The unified cgroup v2 hierarchy is mounted.
    pub cgroup_v2: bool,
    /// Cgroup controllers available in the v2 hierarchy.
    pub cgroup_controllers: HashSet<String>,
    /// Capabilities the kernel knows about.
    pub capabilities: HashSet<Capability>,
}

impl KernelInventory {
    /// Probes the running kernel.
    pub fn detect() -> KernelInventory {
        let inventory = imp::detect();
        debug!(
            "kernel inventory: seccomp={} cgroup_v2={} capabilities={}",
            inventory.seccomp,
            inventory.cgroup_v2,
            inventory.capabilities.len()
        );
        inventory
    }

    /// An inventory with everything available. Used by tests and by
    /// launchers that enforce nothing themselves.
    pub fn all() -> KernelInventory {
        KernelInventory {
            seccomp: true,
            seccomp_actions: [
                SeccompAction::KillProcess,
                SeccompAction::KillThread,
                SeccompAction::Errno,
                SeccompAction::Allow,
            ]
            .into_iter()
            .collect(),
            cgroup_v2: true,
            cgroup_controllers: ["cpu", "memory", "io"]
                .into_iter()
                .map(String::from)
                .collect(),
            capabilities: Capability::all().collect(),
        }
    }

    /// Returns true if the kernel supports this capability.
    pub fn supports_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub fn detect() -> KernelInventory {
        let actions = std::fs::read_to_string("/proc/sys/kernel/seccomp/actions_avail")
            .unwrap_or_default();
        let seccomp_actions: HashSet<SeccompAction> = actions
            .split_whitespace()
            .filter_map(|action| match action {
                "kill_process" => Some(SeccompAction::KillProcess),
                "kill" | "kill_thread" => Some(SeccompAction::KillThread),
                "errno" => Some(SeccompAction::Errno),
                "allow" => Some(SeccompAction::Allow),
                _ => None,
            })
            .collect();

        let controllers = std::fs::read_to_string("/sys/fs/cgroup/cgroup.controllers")
            .unwrap_or_default();
        let cgroup_controllers: HashSet<String> = controllers
            .split_whitespace()
            .map(String::from)
            .collect();

        let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let capabilities = Capability::all()
            .filter(|cap| cap.number() <= last_cap)
            .collect();

        KernelInventory {
            seccomp: !seccomp_actions.is_empty(),
            seccomp_actions,
            cgroup_v2: !cgroup_controllers.is_empty(),
            cgroup_controllers,
            capabilities,
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn detect() -> KernelInventory {
        KernelInventory {
            seccomp: false,
            seccomp_actions: HashSet::new(),
            cgroup_v2: false,
            cgroup_controllers: HashSet::new(),
            capabilities: HashSet::new(),
        }
    }
}
