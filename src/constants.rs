//! # Runtime Constants
//!
//! Defines resource limits, timeouts, and validation bounds for the
//! container runtime. These constants are the **single source of truth**
//! for security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion from malformed
//! packages or misbehaving protocol clients while allowing legitimate
//! workloads.
//!
//! ## Cross-References
//!
//! - [`crate::npk`]: Uses size limits for package parsing
//! - [`crate::api`]: Uses frame limits for protocol decoding
//! - [`crate::engine`]: Uses timeouts for stop escalation

use std::time::Duration;

// =============================================================================
// Package Limits
// =============================================================================
//
// Bounds on the NPK archive sections that are materialized in memory.
// The filesystem image itself is never read into memory as a whole; it
// is streamed during verification and extraction.
// =============================================================================

/// Maximum serialized manifest size (1 MiB).
///
/// **Security**: Prevents memory exhaustion from parsing oversized
/// manifests. Real manifests are typically under 10 KiB.
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum hashes section size (64 KiB).
///
/// **Security**: The hashes section holds two digests and a compression
/// tag. Anything larger is malformed.
pub const MAX_HASHES_SIZE: usize = 64 * 1024;

/// Chunk size for streaming digest computation (64 KiB).
///
/// Verification reads the package in chunks of this size so that
/// arbitrarily large images never need to fit in memory.
pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// NPK file extension used when scanning a repository directory.
pub const NPK_EXT: &str = "npk";

// =============================================================================
// Protocol Limits
// =============================================================================

/// Maximum protocol frame payload size (1 MiB).
///
/// **Security**: A length prefix larger than this is a protocol error,
/// not an allocation request. Prevents a malicious client from forcing
/// the decoder to reserve gigabytes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix width in bytes (big-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Capacity of the per-engine notification broadcast channel.
///
/// Slow observers that fall more than this many notifications behind
/// are dropped rather than allowed to stall the engine.
pub const NOTIFICATION_BUFFER: usize = 128;

// =============================================================================
// Lifecycle Timeouts
// =============================================================================

/// Default graceful stop period (10 seconds).
///
/// Time between the termination signal and the forced SIGKILL during
/// container stop, used when the caller does not specify a timeout.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for process reaping after a forced kill (5 seconds).
///
/// SIGKILL cannot be ignored; if the exit event does not arrive within
/// this window something is wrong with the monitor itself.
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Container Name Validation
// =============================================================================

/// Valid characters for container names.
///
/// **Security**: Excludes `/`, `.`, NUL and other characters that could
/// be used for path traversal when names appear in filesystem paths.
pub const NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container name length.
pub const MAX_NAME_LEN: usize = 128;

// =============================================================================
// Cgroup Defaults
// =============================================================================

/// Cgroup v2 hierarchy mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Name of the runtime's cgroup subtree below [`CGROUP_ROOT`].
pub const CGROUP_SUBTREE: &str = "canister";

/// Interval at which `memory.events` is polled for pressure events.
pub const CGROUP_EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Name Validation Helper
// =============================================================================

/// Validates a container name for safety.
///
/// # Security
///
/// Names end up in filesystem paths (run directories, cgroup paths), so
/// the check is allowlist-based: non-empty, bounded length, and only
/// characters from [`NAME_VALID_CHARS`].
#[inline]
#[must_use = "validation result must be checked before using the name in paths"]
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if !name.chars().all(|c| NAME_VALID_CHARS.contains(c)) {
        return Err("name contains invalid characters");
    }
    Ok(())
}
