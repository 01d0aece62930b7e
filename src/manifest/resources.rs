//! Resource limit, rlimit and capability types.
//!
//! These types describe what a container may consume. They are pure
//! data; the sandbox compiler turns them into cgroup controller
//! assignments, `setrlimit` pairs and a capability bounding set.

use serde::{Deserialize, Serialize};

// =============================================================================
// Cgroup Resources
// =============================================================================

/// CPU resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuResources {
    /// Relative scheduling weight (cgroup v2 `cpu.weight`, 1..=10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
}

/// Memory resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Hard memory ceiling in bytes (`memory.max`).
    ///
    /// Zero or absent means inherit the parent limit (no ceiling).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Block I/O resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkIoResources {
    /// Relative I/O weight (`io.weight`, 1..=10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u16>,
    /// Per-device throughput throttles (`io.max`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttle: Vec<ThrottleDevice>,
}

/// Throughput throttle for one block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDevice {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Read bytes per second limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbps: Option<u64>,
    /// Write bytes per second limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbps: Option<u64>,
}

// =============================================================================
// Rlimits
// =============================================================================

/// Resources addressable via `setrlimit(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RLimitResource {
    /// Maximum core file size.
    Core,
    /// CPU time in seconds.
    Cpu,
    /// Maximum data segment size.
    Data,
    /// Maximum file size.
    Fsize,
    /// Maximum locked memory.
    Memlock,
    /// Maximum number of open files.
    Nofile,
    /// Maximum number of processes.
    Nproc,
    /// Maximum resident set size.
    Rss,
    /// Maximum stack size.
    Stack,
}

impl RLimitResource {
    /// Returns the `RLIMIT_*` constant for this resource.
    #[cfg(target_os = "linux")]
    pub fn as_raw(&self) -> libc::__rlimit_resource_t {
        match self {
            RLimitResource::Core => libc::RLIMIT_CORE,
            RLimitResource::Cpu => libc::RLIMIT_CPU,
            RLimitResource::Data => libc::RLIMIT_DATA,
            RLimitResource::Fsize => libc::RLIMIT_FSIZE,
            RLimitResource::Memlock => libc::RLIMIT_MEMLOCK,
            RLimitResource::Nofile => libc::RLIMIT_NOFILE,
            RLimitResource::Nproc => libc::RLIMIT_NPROC,
            RLimitResource::Rss => libc::RLIMIT_RSS,
            RLimitResource::Stack => libc::RLIMIT_STACK,
        }
    }
}

/// Soft/hard pair for one rlimit.
///
/// An absent value means "unlimited". Validation requires soft ≤ hard
/// when both are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RLimitValue {
    /// Soft limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft: Option<u64>,
    /// Hard limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard: Option<u64>,
}

// =============================================================================
// Capabilities
// =============================================================================

/// Linux capabilities a manifest may request.
///
/// The manifest capability set is an explicit allow-list; everything
/// not listed is dropped from the bounding set before exec. Unknown
/// names fail manifest parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum Capability {
    CAP_AUDIT_CONTROL,
    CAP_AUDIT_READ,
    CAP_AUDIT_WRITE,
    CAP_BLOCK_SUSPEND,
    CAP_CHOWN,
    CAP_DAC_OVERRIDE,
    CAP_DAC_READ_SEARCH,
    CAP_FOWNER,
    CAP_FSETID,
    CAP_IPC_LOCK,
    CAP_IPC_OWNER,
    CAP_KILL,
    CAP_LEASE,
    CAP_LINUX_IMMUTABLE,
    CAP_MAC_ADMIN,
    CAP_MAC_OVERRIDE,
    CAP_MKNOD,
    CAP_NET_ADMIN,
    CAP_NET_BIND_SERVICE,
    CAP_NET_BROADCAST,
    CAP_NET_RAW,
    CAP_SETFCAP,
    CAP_SETGID,
    CAP_SETPCAP,
    CAP_SETUID,
    CAP_SYSLOG,
    CAP_SYS_ADMIN,
    CAP_SYS_BOOT,
    CAP_SYS_CHROOT,
    CAP_SYS_MODULE,
    CAP_SYS_NICE,
    CAP_SYS_PACCT,
    CAP_SYS_PTRACE,
    CAP_SYS_RAWIO,
    CAP_SYS_RESOURCE,
    CAP_SYS_TIME,
    CAP_SYS_TTY_CONFIG,
    CAP_WAKE_ALARM,
}

impl Capability {
    /// Returns the kernel capability number.
    ///
    /// Used to probe `cap_last_cap` support and to drop capabilities
    /// from the bounding set.
    pub fn number(&self) -> u32 {
        match self {
            Capability::CAP_CHOWN => 0,
            Capability::CAP_DAC_OVERRIDE => 1,
            Capability::CAP_DAC_READ_SEARCH => 2,
            Capability::CAP_FOWNER => 3,
            Capability::CAP_FSETID => 4,
            Capability::CAP_KILL => 5,
            Capability::CAP_SETGID => 6,
            Capability::CAP_SETUID => 7,
            Capability::CAP_SETPCAP => 8,
            Capability::CAP_LINUX_IMMUTABLE => 9,
            Capability::CAP_NET_BIND_SERVICE => 10,
            Capability::CAP_NET_BROADCAST => 11,
            Capability::CAP_NET_ADMIN => 12,
            Capability::CAP_NET_RAW => 13,
            Capability::CAP_IPC_LOCK => 14,
            Capability::CAP_IPC_OWNER => 15,
            Capability::CAP_SYS_MODULE => 16,
            Capability::CAP_SYS_RAWIO => 17,
            Capability::CAP_SYS_CHROOT => 18,
            Capability::CAP_SYS_PTRACE => 19,
            Capability::CAP_SYS_PACCT => 20,
            Capability::CAP_SYS_ADMIN => 21,
            Capability::CAP_SYS_BOOT => 22,
            Capability::CAP_SYS_NICE => 23,
            Capability::CAP_SYS_RESOURCE => 24,
            Capability::CAP_SYS_TIME => 25,
            Capability::CAP_SYS_TTY_CONFIG => 26,
            Capability::CAP_MKNOD => 27,
            Capability::CAP_LEASE => 28,
            Capability::CAP_AUDIT_WRITE => 29,
            Capability::CAP_AUDIT_CONTROL => 30,
            Capability::CAP_SETFCAP => 31,
            Capability::CAP_MAC_OVERRIDE => 32,
            Capability::CAP_MAC_ADMIN => 33,
            Capability::CAP_SYSLOG => 34,
            Capability::CAP_WAKE_ALARM => 35,
            Capability::CAP_BLOCK_SUSPEND => 36,
            Capability::CAP_AUDIT_READ => 37,
        }
    }

    /// All capabilities known to this runtime.
    pub fn all() -> impl Iterator<Item = Capability> {
        use Capability::*;
        [
            CAP_AUDIT_CONTROL,
            CAP_AUDIT_READ,
            CAP_AUDIT_WRITE,
            CAP_BLOCK_SUSPEND,
            CAP_CHOWN,
            CAP_DAC_OVERRIDE,
            CAP_DAC_READ_SEARCH,
            CAP_FOWNER,
            CAP_FSETID,
            CAP_IPC_LOCK,
            CAP_IPC_OWNER,
            CAP_KILL,
            CAP_LEASE,
            CAP_LINUX_IMMUTABLE,
            CAP_MAC_ADMIN,
            CAP_MAC_OVERRIDE,
            CAP_MKNOD,
            CAP_NET_ADMIN,
            CAP_NET_BIND_SERVICE,
            CAP_NET_BROADCAST,
            CAP_NET_RAW,
            CAP_SETFCAP,
            CAP_SETGID,
            CAP_SETPCAP,
            CAP_SETUID,
            CAP_SYSLOG,
            CAP_SYS_ADMIN,
            CAP_SYS_BOOT,
            CAP_SYS_CHROOT,
            CAP_SYS_MODULE,
            CAP_SYS_NICE,
            CAP_SYS_PACCT,
            CAP_SYS_PTRACE,
            CAP_SYS_RAWIO,
            CAP_SYS_RESOURCE,
            CAP_SYS_TIME,
            CAP_SYS_TTY_CONFIG,
            CAP_WAKE_ALARM,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
