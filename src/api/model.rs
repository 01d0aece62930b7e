//! # Control Protocol Vocabulary
//!
//! Every value crossing a console connection is a [`Message`]: a
//! request from a client, the engine's response, or an unsolicited
//! notification. The wire representation is JSON inside a
//! length-prefixed frame (see [`crate::api::codec`]).
//!
//! Contract: every request receives exactly one response on the same
//! connection, in request order. Notifications are broadcast to all
//! connections and may interleave with responses at any point.
//!
//! Errors carried in responses are a serializable mirror of the
//! crate error type; the engine-internal error is the source of truth
//! and converted at the connection boundary.

use crate::container::Container;
use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process id.
pub type Pid = u32;

/// Top-level protocol unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

// =============================================================================
// Requests
// =============================================================================

/// Client requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// List all containers with their current state.
    Containers,
    /// Install the package at the given path.
    Install { npk: PathBuf },
    /// Uninstall a container. `force` umounts a mounted container
    /// first; a running container is always refused.
    Uninstall { container: Container, force: bool },
    /// Mount a set of containers.
    Mount { containers: Vec<Container> },
    /// Umount a set of containers.
    Umount { containers: Vec<Container> },
    /// Start a mounted container.
    Start { container: Container },
    /// Stop a running container: send `signal` (SIGTERM if absent),
    /// escalate to SIGKILL after `timeout_secs`.
    Stop {
        container: Container,
        signal: Option<i32>,
        timeout_secs: u64,
    },
    /// Shut the engine down: stop and umount everything.
    Shutdown,
}

// =============================================================================
// Responses
// =============================================================================

/// Engine responses. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Containers { containers: Vec<ContainerData> },
    Install { container: Container },
    Start { process: Process },
    Stop { status: ExitStatus },
    Mount { results: Vec<MountResult> },
    Umount { results: Vec<UmountResult> },
    Error { error: Error },
}

/// State snapshot of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerData {
    pub container: Container,
    pub manifest: Manifest,
    /// Current lifecycle state name.
    pub state: String,
    /// Running process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
}

/// A spawned container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: Pid,
    /// Uptime in seconds at the time of the snapshot.
    pub uptime_secs: u64,
}

/// Per-container outcome of a mount request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MountResult {
    Ok { container: Container },
    Error { container: Container, error: Error },
}

/// Per-container outcome of an umount request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UmountResult {
    Ok { container: Container },
    Error { container: Container, error: Error },
}

// =============================================================================
// Notifications
// =============================================================================

/// Unsolicited events, broadcast to every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    /// A container was installed.
    Installed { container: Container },
    /// A container was uninstalled.
    Uninstalled { container: Container },
    /// A container process was spawned.
    Started { container: Container, pid: Pid },
    /// A container process exited, voluntarily or not.
    Exit {
        container: Container,
        status: ExitStatus,
    },
    /// A cgroup event fired for a running container. The field name
    /// must stay clear of the enum's serde tag.
    CGroup {
        container: Container,
        event: CgroupNotification,
    },
    /// The engine is shutting down.
    Shutdown,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited with a code.
    Exit { code: i32 },
    /// Terminated by a signal.
    Signalled { signal: i32 },
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exit { code } => write!(f, "exit code {code}"),
            ExitStatus::Signalled { signal } => write!(f, "signal {signal}"),
        }
    }
}

/// Cgroup-originated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cgroup", rename_all = "snake_case")]
pub enum CgroupNotification {
    Memory(MemoryNotification),
}

/// Counters from `memory.events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNotification {
    /// Times the cgroup hit its limit.
    pub oom: u64,
    /// Times the OOM killer fired inside the cgroup.
    pub oom_kill: u64,
}

// =============================================================================
// Wire Error
// =============================================================================

/// Serializable mirror of the engine error, scoped to what clients can
/// act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum Error {
    /// Container is unknown.
    InvalidContainer { container: Container },
    /// Another transition is in flight.
    Busy { container: Container },
    /// Operation does not apply in the current state.
    InvalidState { message: String },
    /// Package rejected: malformed or failed verification.
    Package { message: String },
    /// Manifest rejected.
    Manifest { message: String },
    /// Sandbox could not be constructed.
    Sandbox { message: String },
    /// Anything else.
    Internal { message: String },
}

impl From<&crate::error::Error> for Error {
    fn from(e: &crate::error::Error) -> Self {
        use crate::error::Error as E;
        match e {
            E::InvalidContainer(container) => Error::InvalidContainer {
                container: container.clone(),
            },
            E::Busy(container) => Error::Busy {
                container: container.clone(),
            },
            E::InvalidState { .. }
            | E::StartContainerResource(_)
            | E::StartMissingResource { .. }
            | E::UmountBusy { .. }
            | E::InstallDuplicate(_) => Error::InvalidState {
                message: e.to_string(),
            },
            E::InvalidArchive(_) | E::VerificationFailed(_) | E::UnsupportedCompression(_) => {
                Error::Package {
                    message: e.to_string(),
                }
            }
            E::InvalidName { .. } | E::InvalidVersion(_) | E::ManifestInvalid(_) => {
                Error::Manifest {
                    message: e.to_string(),
                }
            }
            E::Sandbox(_)
            | E::SeccompConflict { .. }
            | E::UnknownSyscall(_)
            | E::UnsupportedCapability(_) => Error::Sandbox {
                message: e.to_string(),
            },
            _ => Error::Internal {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde() {
        let request = Request::Stop {
            container: Container::try_from("app:1.0.0").unwrap(),
            signal: None,
            timeout_secs: 10,
        };
        let json = serde_json::to_string(&Message::Request(request.clone())).unwrap();
        assert!(json.contains("\"message\":\"request\""));
        assert!(json.contains("\"request\":\"stop\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::Request(request));
    }

    #[test]
    fn test_notification_serde() {
        let notification = Notification::Exit {
            container: Container::try_from("app:1.0.0").unwrap(),
            status: ExitStatus::Signalled { signal: 9 },
        };
        let json = serde_json::to_string(&Message::Notification(notification.clone())).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::Notification(notification));
    }

    #[test]
    fn test_cgroup_notification_serde() {
        let notification = Notification::CGroup {
            container: Container::try_from("app:1.0.0").unwrap(),
            event: CgroupNotification::Memory(MemoryNotification {
                oom: 1,
                oom_kill: 0,
            }),
        };
        let json = serde_json::to_string(&Message::Notification(notification.clone())).unwrap();
        assert!(json.contains("\"notification\":\"c_group\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::Notification(notification));
    }

    #[test]
    fn test_error_conversion() {
        let container = Container::try_from("app:1.0.0").unwrap();
        let error = crate::error::Error::Busy(container.clone());
        assert_eq!(Error::from(&error), Error::Busy { container });
    }
}
