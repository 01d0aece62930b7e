//! # Process Launchers
//!
//! A [`Launcher`] is the engine's only door to the kernel: it unpacks
//! verified images, spawns processes inside a compiled sandbox, and
//! reaps them. The engine depends exclusively on the trait, so the
//! whole privileged surface lives behind one seam with one
//! implementation per target OS plus a mock for tests.
//!
//! ## Native Launcher (Linux)
//!
//! `spawn` applies the sandbox between fork and exec, in this order:
//!
//! 1. parent: create the container cgroup and write the compiled
//!    controller assignments
//! 2. child: join the cgroup, apply rlimits, drop every capability
//!    outside the allow-list from the bounding set, chroot into the
//!    verified root, switch uid/gid
//! 3. child: install the seccomp filter last, immediately before exec
//!
//! A failure at any step aborts the exec; nothing runs half-sandboxed.
//!
//! Cgroup memory events are surfaced by polling `memory.events` and
//! pushing deltas into the per-process event channel.

use crate::api::model::{CgroupNotification, ExitStatus, MemoryNotification, Pid};
use crate::constants::{CGROUP_EVENT_POLL_INTERVAL, CGROUP_ROOT, CGROUP_SUBTREE};
use crate::error::{Error, Result};
use crate::manifest::{Io, Output};
use crate::npk::Npk;
use crate::sandbox::SandboxSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything a launcher needs to exec a container process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Verified container root filesystem.
    pub root: PathBuf,
    /// Init binary, relative to the root.
    pub init: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub uid: u32,
    pub gid: u32,
    /// Stdio routing; absent means discard.
    pub io: Option<Io>,
}

/// A spawned container process.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Cgroup events for this process. Closed when monitoring stops.
    pub events: mpsc::Receiver<CgroupNotification>,
}

/// Kernel-facing capability consumed by the engine.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unpacks and verifies the package image at `target`, returning
    /// the root path. The image digest is re-checked during the unpack;
    /// a tampered image never becomes a root.
    async fn mount(&self, npk: &Npk, target: &Path) -> Result<PathBuf>;

    /// Removes a mounted root.
    async fn umount(&self, root: &Path) -> Result<()>;

    /// Spawns a process inside the compiled sandbox.
    async fn spawn(&self, spec: &SandboxSpec, config: &SpawnConfig) -> Result<Spawned>;

    /// Delivers a signal.
    async fn signal(&self, pid: Pid, signal: i32) -> Result<()>;

    /// Awaits process exit. Called exactly once per spawned pid.
    async fn wait(&self, pid: Pid) -> Result<ExitStatus>;
}

// =============================================================================
// Native Launcher
// =============================================================================

/// Launcher backed by the host kernel.
///
/// On non-Linux hosts mount/umount work (they are plain file I/O) and
/// everything process-related reports the platform as unsupported.
pub struct NativeLauncher {
    #[cfg(target_os = "linux")]
    children: std::sync::Mutex<HashMap<Pid, tokio::process::Child>>,
}

impl NativeLauncher {
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            children: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl Default for NativeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for NativeLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn mount(&self, npk: &Npk, target: &Path) -> Result<PathBuf> {
        let npk = npk.clone();
        let target = target.to_owned();
        tokio::task::spawn_blocking(move || {
            npk.unpack_image(&target)?;
            Ok(target)
        })
        .await
        .map_err(|e| Error::Shutdown(format!("mount task panicked: {e}")))?
    }

    async fn umount(&self, root: &Path) -> Result<()> {
        let root = root.to_owned();
        tokio::task::spawn_blocking(move || {
            std::fs::remove_dir_all(&root)
                .map_err(|e| Error::io(format!("remove {}", root.display()), e))
        })
        .await
        .map_err(|e| Error::Shutdown(format!("umount task panicked: {e}")))?
    }

    #[cfg(target_os = "linux")]
    async fn spawn(&self, spec: &SandboxSpec, config: &SpawnConfig) -> Result<Spawned> {
        let cgroup_dir = linux::setup_cgroup(spec)?;
        let mut child = linux::spawn(spec, config, &cgroup_dir)?;
        let io = config.io.clone().unwrap_or_default();
        linux::forward_logs(&spec.container, &mut child, &io);
        let pid = child
            .id()
            .ok_or_else(|| Error::SpawnFailed {
                container: spec.container.clone(),
                reason: "process exited before pid was read".to_string(),
            })?;

        let (events_tx, events) = mpsc::channel(16);
        tokio::spawn(linux::monitor_cgroup(cgroup_dir, events_tx));

        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);
        debug!("spawned {} as pid {pid}", spec.container);
        Ok(Spawned { pid, events })
    }

    #[cfg(not(target_os = "linux"))]
    async fn spawn(&self, spec: &SandboxSpec, _config: &SpawnConfig) -> Result<Spawned> {
        Err(Error::SpawnFailed {
            container: spec.container.clone(),
            reason: "process sandboxing requires linux".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    async fn signal(&self, pid: Pid, signal: i32) -> Result<()> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            return Err(Error::SignalFailed {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn signal(&self, pid: Pid, _signal: i32) -> Result<()> {
        Err(Error::SignalFailed {
            pid,
            reason: "signals require linux".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    async fn wait(&self, pid: Pid) -> Result<ExitStatus> {
        let child = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
        let mut child = child.ok_or(Error::SignalFailed {
            pid,
            reason: "unknown pid".to_string(),
        })?;
        let status = child
            .wait()
            .await
            .map_err(|e| Error::io(format!("wait for pid {pid}"), e))?;

        use std::os::unix::process::ExitStatusExt;
        let status = match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Exit { code },
            (None, Some(signal)) => ExitStatus::Signalled { signal },
            (None, None) => ExitStatus::Exit { code: -1 },
        };
        Ok(status)
    }

    #[cfg(not(target_os = "linux"))]
    async fn wait(&self, pid: Pid) -> Result<ExitStatus> {
        Err(Error::SignalFailed {
            pid,
            reason: "process supervision requires linux".to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::container::Container;
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tracing::info;

    /// Creates the container cgroup and applies the compiled limits.
    pub(super) fn setup_cgroup(spec: &SandboxSpec) -> Result<PathBuf> {
        let dir = Path::new(CGROUP_ROOT)
            .join(CGROUP_SUBTREE)
            .join(format!("{}-{}", spec.container.name(), spec.container.version()));
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("create cgroup {}", dir.display()), e))?;
        spec.cgroups.apply(&dir)?;
        Ok(dir)
    }

    pub(super) fn spawn(
        spec: &SandboxSpec,
        config: &SpawnConfig,
        cgroup_dir: &Path,
    ) -> Result<tokio::process::Child> {
        let mut command = tokio::process::Command::new(&config.init);
        command
            .args(&config.args)
            .env_clear()
            .envs(&config.env)
            .kill_on_drop(false);

        let io = config.io.clone().unwrap_or_default();
        command.stdin(Stdio::null());
        command.stdout(stdio_for(io.stdout));
        command.stderr(stdio_for(io.stderr));

        let sandbox = spec.clone();
        let root = config.root.clone();
        let uid = config.uid;
        let gid = config.gid;
        let cgroup_procs = cgroup_dir.join("cgroup.procs");
        // SAFETY: the closure runs post-fork pre-exec and only calls
        // async-signal-tolerable operations; any failure aborts exec.
        unsafe {
            command.pre_exec(move || apply_sandbox(&sandbox, &root, uid, gid, &cgroup_procs));
        }

        command.spawn().map_err(|e| Error::SpawnFailed {
            container: spec.container.clone(),
            reason: e.to_string(),
        })
    }

    /// True for streams the runtime captures and routes to its own log.
    fn captured(output: Output) -> bool {
        matches!(output, Output::Log)
    }

    fn stdio_for(output: Output) -> Stdio {
        match output {
            Output::Log => Stdio::piped(),
            Output::Discard => Stdio::null(),
            Output::Inherit => Stdio::inherit(),
        }
    }

    /// Takes the piped stdio handles and forwards them line by line
    /// into the runtime log, one task per stream.
    pub(super) fn forward_logs(container: &Container, child: &mut tokio::process::Child, io: &Io) {
        if captured(io.stdout) {
            if let Some(stdout) = child.stdout.take() {
                let container = container.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        info!("{container}: {line}");
                    }
                });
            }
        }
        if captured(io.stderr) {
            if let Some(stderr) = child.stderr.take() {
                let container = container.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        warn!("{container}: {line}");
                    }
                });
            }
        }
    }

    /// Child-side sandbox application. Order matters: the seccomp
    /// filter goes last so every preceding step may still use syscalls
    /// the filter would deny.
    fn apply_sandbox(
        spec: &SandboxSpec,
        root: &Path,
        uid: u32,
        gid: u32,
        cgroup_procs: &Path,
    ) -> std::io::Result<()> {
        use crate::manifest::Capability;

        // Join the prepared cgroup before anything else so every limit
        // covers the full lifetime of the process.
        let pid = unsafe { libc::getpid() };
        std::fs::write(cgroup_procs, pid.to_string())?;

        for (resource, value) in &spec.rlimits {
            let limit = libc::rlimit {
                rlim_cur: value.soft.unwrap_or(libc::RLIM_INFINITY),
                rlim_max: value.hard.unwrap_or(libc::RLIM_INFINITY),
            };
            if unsafe { libc::setrlimit(resource.as_raw(), &limit) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        if let Some(context) = &spec.selinux {
            std::fs::write("/proc/thread-self/attr/exec", context)?;
        }

        for capability in Capability::all() {
            if spec.capabilities.contains(&capability) {
                continue;
            }
            let rc = unsafe {
                libc::prctl(libc::PR_CAPBSET_DROP, capability.number() as libc::c_ulong, 0, 0, 0)
            };
            // EINVAL means the kernel does not know this capability,
            // which is equivalent to it being dropped.
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINVAL) {
                    return Err(err);
                }
            }
        }

        use std::os::unix::ffi::OsStrExt;
        let root_c = std::ffi::CString::new(root.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        if unsafe { libc::chroot(root_c.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        std::env::set_current_dir("/")?;

        if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        if let Some(filter) = &spec.seccomp {
            filter
                .install()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(())
    }

    /// Polls `memory.events` and pushes deltas into the event channel.
    /// Ends when the receiver is dropped or the cgroup disappears.
    pub(super) async fn monitor_cgroup(
        dir: PathBuf,
        events: mpsc::Sender<CgroupNotification>,
    ) {
        let path = dir.join("memory.events");
        let mut last = MemoryNotification::default();
        loop {
            tokio::time::sleep(CGROUP_EVENT_POLL_INTERVAL).await;
            if events.is_closed() {
                break;
            }
            let current = match tokio::fs::read_to_string(&path).await {
                Ok(content) => parse_memory_events(&content),
                Err(_) => break,
            };
            if current != last {
                last = current;
                if events
                    .send(CgroupNotification::Memory(current))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        // The cgroup is removed once the process is gone.
        if let Err(e) = std::fs::remove_dir(&dir) {
            debug!("leaving cgroup {}: {e}", dir.display());
        }
    }

    fn parse_memory_events(content: &str) -> MemoryNotification {
        let mut notification = MemoryNotification::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(|v| v.parse().ok())) {
                (Some("oom"), Some(value)) => notification.oom = value,
                (Some("oom_kill"), Some(value)) => notification.oom_kill = value,
                _ => {}
            }
        }
        notification
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_only_log_output_is_captured() {
            assert!(captured(Output::Log));
            assert!(!captured(Output::Discard));
            assert!(!captured(Output::Inherit));
        }

        #[test]
        fn test_parse_memory_events() {
            let content = "low 0\nhigh 2\nmax 5\noom 1\noom_kill 1\n";
            let parsed = parse_memory_events(content);
            assert_eq!(
                parsed,
                MemoryNotification {
                    oom: 1,
                    oom_kill: 1
                }
            );
        }
    }
}

// =============================================================================
// Mock Launcher
// =============================================================================

/// In-memory launcher for tests: no kernel interaction, full control
/// over process lifetime from the test body.
pub struct MockLauncher {
    state: std::sync::Mutex<MockState>,
    /// Sandbox specs seen by `spawn`, for assertions.
    specs: std::sync::Mutex<Vec<SandboxSpec>>,
    /// Signals refused to terminate the process (exit must be forced
    /// with SIGKILL or triggered explicitly).
    ignore_signals: Vec<i32>,
}

#[derive(Default)]
struct MockState {
    next_pid: Pid,
    processes: HashMap<Pid, MockProcess>,
}

struct MockProcess {
    exit_tx: Option<tokio::sync::oneshot::Sender<ExitStatus>>,
    exit_rx: Option<tokio::sync::oneshot::Receiver<ExitStatus>>,
    events_tx: mpsc::Sender<CgroupNotification>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::with_ignored_signals(Vec::new())
    }

    /// A launcher whose processes ignore the listed signals. Listing
    /// SIGKILL models an unreapable process (real processes cannot
    /// mask it, but a stuck kernel thread behaves the same way).
    pub fn with_ignored_signals(ignore_signals: Vec<i32>) -> Self {
        Self {
            state: std::sync::Mutex::new(MockState {
                next_pid: 1000,
                processes: HashMap::new(),
            }),
            specs: std::sync::Mutex::new(Vec::new()),
            ignore_signals,
        }
    }

    /// Terminates a mock process with the given status.
    pub fn exit(&self, pid: Pid, status: ExitStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(process) = state.processes.get_mut(&pid) {
            if let Some(tx) = process.exit_tx.take() {
                let _ = tx.send(status);
            }
        }
    }

    /// Pushes a cgroup event for a mock process.
    pub async fn push_memory_event(&self, pid: Pid, notification: MemoryNotification) {
        let tx = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .processes
                .get(&pid)
                .map(|process| process.events_tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(CgroupNotification::Memory(notification)).await;
        }
    }

    /// Sandbox specs passed to `spawn`, in call order.
    pub fn spawned_specs(&self) -> Vec<SandboxSpec> {
        self.specs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn mount(&self, npk: &Npk, target: &Path) -> Result<PathBuf> {
        npk.unpack_image(target)?;
        Ok(target.to_owned())
    }

    async fn umount(&self, root: &Path) -> Result<()> {
        std::fs::remove_dir_all(root).map_err(|e| Error::io(format!("remove {}", root.display()), e))
    }

    async fn spawn(&self, spec: &SandboxSpec, _config: &SpawnConfig) -> Result<Spawned> {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let (events_tx, events) = mpsc::channel(16);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(
            pid,
            MockProcess {
                exit_tx: Some(exit_tx),
                exit_rx: Some(exit_rx),
                events_tx,
            },
        );
        Ok(Spawned { pid, events })
    }

    async fn signal(&self, pid: Pid, signal: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or(Error::SignalFailed {
                pid,
                reason: "unknown pid".to_string(),
            })?;
        if self.ignore_signals.contains(&signal) {
            warn!("mock pid {pid} ignores signal {signal}");
            return Ok(());
        }
        if let Some(tx) = process.exit_tx.take() {
            let _ = tx.send(ExitStatus::Signalled { signal });
        }
        Ok(())
    }

    async fn wait(&self, pid: Pid) -> Result<ExitStatus> {
        let exit_rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .processes
                .get_mut(&pid)
                .and_then(|process| process.exit_rx.take())
        };
        let exit_rx = exit_rx.ok_or(Error::SignalFailed {
            pid,
            reason: "unknown or already reaped pid".to_string(),
        })?;
        let status = exit_rx
            .await
            .map_err(|_| Error::Shutdown(format!("mock pid {pid} vanished")))?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.processes.remove(&pid);
        Ok(status)
    }
}
