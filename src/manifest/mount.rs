//! Mount table entry types.
//!
//! A manifest declares its mounts as a map from absolute target path to
//! mount kind. The engine turns these into concrete mount operations
//! when the container starts.

use crate::container::{Name, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A single mount table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mount {
    /// Bind mount of a host path into the container.
    Bind(Bind),
    /// Writable directory persisted across container restarts.
    Persist,
    /// Kernel proc filesystem, mounted read-only.
    Proc,
    /// In-memory tmpfs with a size ceiling.
    Tmpfs(Tmpfs),
    /// Minimal /dev with the standard character devices.
    Dev,
    /// Read-only content provided by another (resource) container.
    Resource(Resource),
}

/// Bind mount parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    /// Host path to bind.
    pub host: PathBuf,
    /// Mount options.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub options: BTreeSet<MountOption>,
}

/// Tmpfs parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tmpfs {
    /// Size ceiling in bytes.
    pub size: u64,
}

/// Reference to content inside a resource container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Name of the resource container.
    pub name: Name,
    /// Exact version of the resource container.
    pub version: Version,
    /// Directory within the resource container to mount.
    pub dir: PathBuf,
    /// Mount options.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub options: BTreeSet<MountOption>,
}

/// Mount options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountOption {
    /// Read-write (bind mounts are read-only by default).
    Rw,
    /// Disallow setuid/setgid bits.
    NoSuid,
    /// Disallow execution of binaries.
    NoExec,
    /// Disallow device files.
    NoDev,
}

impl std::fmt::Display for MountOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountOption::Rw => write!(f, "rw"),
            MountOption::NoSuid => write!(f, "nosuid"),
            MountOption::NoExec => write!(f, "noexec"),
            MountOption::NoDev => write!(f, "nodev"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_serde_tagged() {
        let mount = Mount::Tmpfs(Tmpfs { size: 4096 });
        let json = serde_json::to_string(&mount).unwrap();
        assert!(json.contains("\"type\":\"tmpfs\""));
        assert!(json.contains("\"size\":4096"));

        let back: Mount = serde_json::from_str(&json).unwrap();
        assert_eq!(mount, back);
    }

    #[test]
    fn test_bind_options_default_empty() {
        let json = r#"{"type":"bind","host":"/lib"}"#;
        let mount: Mount = serde_json::from_str(json).unwrap();
        match mount {
            Mount::Bind(bind) => assert!(bind.options.is_empty()),
            _ => panic!("expected bind"),
        }
    }
}
