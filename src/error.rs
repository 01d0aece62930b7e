//! Error types for the container runtime.

use crate::container::Container;
use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Identifier / Manifest Errors
    // =========================================================================
    /// Container name failed validation.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Version string failed to parse.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// Manifest failed validation.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    // =========================================================================
    // Package Errors
    // =========================================================================
    /// Package archive is malformed.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// A digest in the package does not match the recomputed value.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The package declares a compression algorithm this runtime cannot
    /// decompress.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    // =========================================================================
    // Repository Errors
    // =========================================================================
    /// Repository initialization failed.
    #[error("failed to initialize repository at {}: {reason}", .path.display())]
    RepositoryInit { path: PathBuf, reason: String },

    /// Container already present in the repository.
    #[error("container {0} is already installed")]
    InstallDuplicate(Container),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Container is not known to the engine.
    #[error("invalid container {0}")]
    InvalidContainer(Container),

    /// Another transition is in flight for this container.
    #[error("container {0} is busy")]
    Busy(Container),

    /// Operation requested in an incompatible state.
    #[error("container {container} is {state}, expected {expected}")]
    InvalidState {
        container: Container,
        state: String,
        expected: String,
    },

    /// Start refused because the container is a resource (no init).
    #[error("container {0} is a resource container")]
    StartContainerResource(Container),

    /// A resource container required by the manifest is missing.
    #[error("container {container} requires missing resource {name}:{version}")]
    StartMissingResource {
        container: Container,
        name: String,
        version: String,
    },

    /// Umount refused because the container is used by a running one.
    #[error("container {container} is in use by {user}")]
    UmountBusy { container: Container, user: Container },

    /// Process spawn failed.
    #[error("failed to spawn {container}: {reason}")]
    SpawnFailed { container: Container, reason: String },

    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    /// The process survived SIGKILL; supervision gave up on it.
    #[error("container {container} (pid {pid}) survived SIGKILL")]
    StopFailed { container: Container, pid: u32 },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// Sandbox compilation failed. The container state is unchanged.
    #[error("sandbox: {0}")]
    Sandbox(String),

    /// Two seccomp rules constrain the same syscall argument
    /// incompatibly.
    #[error("seccomp: conflicting argument constraints for '{syscall}' index {index}")]
    SeccompConflict { syscall: String, index: usize },

    /// A syscall named in an explicit allow rule is unknown on this
    /// platform.
    #[error("seccomp: unknown syscall '{0}'")]
    UnknownSyscall(String),

    /// The manifest requests a capability the kernel does not support.
    #[error("capability {0} is not available on this kernel")]
    UnsupportedCapability(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Frame length prefix exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame payload failed to deserialize.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Connection closed mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    // =========================================================================
    // Engine-Fatal Errors
    // =========================================================================
    /// The engine event loop or state table is unrecoverable.
    #[error("engine shutdown: {0}")]
    Shutdown(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// I/O error with context.
    #[error("io: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Wraps an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
