//! # Cgroup v2 Resource Mapping
//!
//! Maps manifest resource sections onto unified-hierarchy controller
//! files. Compilation produces a plain list of file/value assignments;
//! applying them is a directory of writes under the container's cgroup,
//! done by the launcher after the cgroup is created.
//!
//! | Manifest field      | Controller file | Value                     |
//! |---------------------|-----------------|---------------------------|
//! | `cpu.shares`        | `cpu.weight`    | clamped to 1..=10000      |
//! | `memory.limit`      | `memory.max`    | bytes; 0/unset = inherit  |
//! | `blkio.weight`      | `io.weight`     | clamped to 1..=10000      |
//! | `blkio.throttle[]`  | `io.max`        | `maj:min rbps=N wbps=N`   |

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::platform::KernelInventory;
use std::path::Path;
use tracing::debug;

/// One controller file assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupAssignment {
    /// File name relative to the container's cgroup directory.
    pub file: String,
    /// Value written verbatim.
    pub value: String,
}

/// Compiled cgroup directives for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupSpec {
    pub assignments: Vec<CgroupAssignment>,
}

impl CgroupSpec {
    /// Writes every assignment into the cgroup directory at `dir`.
    pub fn apply(&self, dir: &Path) -> Result<()> {
        for assignment in &self.assignments {
            let path = dir.join(&assignment.file);
            debug!("cgroup {} <- {}", path.display(), assignment.value);
            std::fs::write(&path, &assignment.value)
                .map_err(|e| Error::io(format!("write {}", path.display()), e))?;
        }
        Ok(())
    }

    /// Looks up the value assigned to a controller file, if any.
    pub fn get(&self, file: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.file == file)
            .map(|a| a.value.as_str())
    }
}

/// Compiles the resource sections of a manifest.
///
/// Requesting a limit whose controller the kernel does not expose is a
/// compile error; limits are never silently dropped.
pub fn compile(manifest: &Manifest, inventory: &KernelInventory) -> Result<CgroupSpec> {
    let mut assignments = Vec::new();

    if let Some(cpu) = &manifest.cpu {
        if let Some(shares) = cpu.shares {
            require_controller(inventory, "cpu")?;
            assignments.push(CgroupAssignment {
                file: "cpu.weight".to_string(),
                value: shares.clamp(1, 10_000).to_string(),
            });
        }
    }

    if let Some(memory) = &manifest.memory {
        // Zero means inherit, same as absent.
        if let Some(limit) = memory.limit.filter(|l| *l > 0) {
            require_controller(inventory, "memory")?;
            assignments.push(CgroupAssignment {
                file: "memory.max".to_string(),
                value: limit.to_string(),
            });
        }
    }

    if let Some(blkio) = &manifest.blkio {
        if let Some(weight) = blkio.weight {
            require_controller(inventory, "io")?;
            assignments.push(CgroupAssignment {
                file: "io.weight".to_string(),
                value: u64::from(weight).clamp(1, 10_000).to_string(),
            });
        }
        for throttle in &blkio.throttle {
            require_controller(inventory, "io")?;
            let mut value = format!("{}:{}", throttle.major, throttle.minor);
            match throttle.rbps {
                Some(rbps) => value.push_str(&format!(" rbps={rbps}")),
                None => value.push_str(" rbps=max"),
            }
            match throttle.wbps {
                Some(wbps) => value.push_str(&format!(" wbps={wbps}")),
                None => value.push_str(" wbps=max"),
            }
            assignments.push(CgroupAssignment {
                file: "io.max".to_string(),
                value,
            });
        }
    }

    Ok(CgroupSpec { assignments })
}

fn require_controller(inventory: &KernelInventory, controller: &str) -> Result<()> {
    if !inventory.cgroup_v2 {
        return Err(Error::Sandbox(
            "manifest requests resource limits but cgroup v2 is not mounted".to_string(),
        ));
    }
    if !inventory.cgroup_controllers.contains(controller) {
        return Err(Error::Sandbox(format!(
            "cgroup controller '{controller}' is not available"
        )));
    }
    Ok(())
}
