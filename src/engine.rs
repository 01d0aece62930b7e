//! # Lifecycle Engine
//!
//! Owns the authoritative container state table and sequences every
//! transition:
//!
//! ```text
//! NotInstalled --install--> Installed --mount--> Mounted
//! Mounted --start--> Starting --spawned--> Running
//! Running --stop--> Stopping --exited--> Stopped
//! Running --self exit--> Exited
//! Stopped/Exited --umount--> Installed --uninstall--> NotInstalled
//! ```
//!
//! `NotInstalled` is represented by absence from the table.
//!
//! ## Concurrency Model
//!
//! The table is a `RwLock<HashMap>`; list queries take the read lock.
//! A transition claims its container under the write lock (exists,
//! not busy, state admissible → set busy), performs the expensive work
//! (verification, unpack, sandbox compilation, spawn) off the lock,
//! and commits or rolls back under the write lock again. A busy
//! container rejects further transitions with [`Error::Busy`]; nothing
//! is queued. Different containers transition fully in parallel, and a
//! Running container holds no lock.
//!
//! Each spawned process gets a monitor task that awaits exit and
//! forwards cgroup events; its completion commits Running→Exited or
//! Stopping→Stopped and broadcasts the exit, so supervision never
//! blocks request handling.

use crate::api::model::{ContainerData, ExitStatus, Notification, Pid, Process};
use crate::constants::{KILL_REAP_TIMEOUT, NOTIFICATION_BUFFER};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::launcher::{Launcher, SpawnConfig, Spawned};
use crate::manifest::Manifest;
use crate::platform::KernelInventory;
use crate::repository::Repository;
use crate::sandbox;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Lifecycle state of one container.
#[derive(Debug, Clone)]
pub enum ContainerState {
    Installed,
    Mounted { root: PathBuf },
    Starting { root: PathBuf },
    Running { root: PathBuf, pid: Pid, started: Instant },
    Stopping { root: PathBuf, pid: Pid },
    Stopped { root: PathBuf },
    Exited { root: PathBuf, status: ExitStatus },
}

impl ContainerState {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerState::Installed => "installed",
            ContainerState::Mounted { .. } => "mounted",
            ContainerState::Starting { .. } => "starting",
            ContainerState::Running { .. } => "running",
            ContainerState::Stopping { .. } => "stopping",
            ContainerState::Stopped { .. } => "stopped",
            ContainerState::Exited { .. } => "exited",
        }
    }

    fn root(&self) -> Option<&PathBuf> {
        match self {
            ContainerState::Installed => None,
            ContainerState::Mounted { root }
            | ContainerState::Starting { root }
            | ContainerState::Running { root, .. }
            | ContainerState::Stopping { root, .. }
            | ContainerState::Stopped { root }
            | ContainerState::Exited { root, .. } => Some(root),
        }
    }
}

struct Entry {
    state: ContainerState,
    /// A transition is in flight; all other transitions are rejected.
    busy: bool,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding unpacked container roots.
    pub run_dir: PathBuf,
    /// Directory holding installed packages.
    pub repository_dir: PathBuf,
}

struct Inner {
    run_dir: PathBuf,
    repository: Mutex<Repository>,
    launcher: Arc<dyn Launcher>,
    inventory: KernelInventory,
    containers: RwLock<HashMap<Container, Entry>>,
    notifications: broadcast::Sender<Notification>,
}

/// Handle to the lifecycle engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine over an existing repository.
    ///
    /// Every package found in the repository enters the table as
    /// `Installed`. Autostart is a separate, explicit step
    /// ([`Engine::autostart`]).
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn Launcher>,
        inventory: KernelInventory,
    ) -> Result<Engine> {
        std::fs::create_dir_all(&config.run_dir)
            .map_err(|e| Error::io(format!("create {}", config.run_dir.display()), e))?;
        let repository = Repository::open(&config.repository_dir)?;

        let containers = repository
            .containers()
            .into_iter()
            .map(|container| {
                (
                    container,
                    Entry {
                        state: ContainerState::Installed,
                        busy: false,
                    },
                )
            })
            .collect();

        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        info!("engine up with launcher '{}'", launcher.name());
        Ok(Engine {
            inner: Arc::new(Inner {
                run_dir: config.run_dir,
                repository: Mutex::new(repository),
                launcher,
                inventory,
                containers: RwLock::new(containers),
                notifications,
            }),
        })
    }

    /// Subscribes to the notification broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    fn notify(&self, notification: Notification) {
        if self.inner.notifications.receiver_count() > 0 {
            let _ = self.inner.notifications.send(notification);
        }
    }

    fn manifest(&self, container: &Container) -> Result<Manifest> {
        let repository = lock(&self.inner.repository);
        repository
            .get(container)
            .map(|npk| npk.manifest().clone())
            .ok_or_else(|| Error::InvalidContainer(container.clone()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of all containers.
    pub fn containers(&self) -> Vec<ContainerData> {
        let table = read(&self.inner.containers);
        let repository = lock(&self.inner.repository);
        let mut data: Vec<ContainerData> = table
            .iter()
            .filter_map(|(container, entry)| {
                let manifest = repository.get(container)?.manifest().clone();
                let process = match &entry.state {
                    ContainerState::Running { pid, started, .. } => Some(Process {
                        pid: *pid,
                        uptime_secs: started.elapsed().as_secs(),
                    }),
                    _ => None,
                };
                Some(ContainerData {
                    container: container.clone(),
                    manifest,
                    state: entry.state.name().to_string(),
                    process,
                })
            })
            .collect();
        data.sort_by(|a, b| a.container.cmp(&b.container));
        data
    }

    // =========================================================================
    // Install / Uninstall
    // =========================================================================

    /// Installs the package at `npk` into the repository.
    pub async fn install(&self, npk: &std::path::Path) -> Result<Container> {
        // The copy and digest verification are blocking file work and
        // run without the repository lock; the lock covers only the
        // duplicate check and the rename into place.
        let dir = lock(&self.inner.repository).dir().to_owned();
        let src = npk.to_owned();
        let (staging, staged) =
            tokio::task::spawn_blocking(move || Repository::stage(&dir, &src))
                .await
                .map_err(|e| Error::Shutdown(format!("install task failed: {e}")))??;
        let container = {
            let mut repository = lock(&self.inner.repository);
            repository.promote(staging, staged)?
        };
        let mut table = write(&self.inner.containers);
        table.insert(
            container.clone(),
            Entry {
                state: ContainerState::Installed,
                busy: false,
            },
        );
        drop(table);
        self.notify(Notification::Installed {
            container: container.clone(),
        });
        Ok(container)
    }

    /// Uninstalls a container.
    ///
    /// Without `force` the container must be `Installed`. With `force`
    /// a mounted, stopped or exited container is umounted first. A
    /// running container is always refused; stop it first.
    pub async fn uninstall(&self, container: &Container, force: bool) -> Result<()> {
        let root = {
            let mut table = write(&self.inner.containers);
            let entry = table
                .get_mut(container)
                .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
            if entry.busy {
                return Err(Error::Busy(container.clone()));
            }
            match (&entry.state, force) {
                (ContainerState::Installed, _) => {
                    // Claim even without a umount so a concurrent mount
                    // cannot slip in before the entry is removed.
                    entry.busy = true;
                    None
                }
                (
                    ContainerState::Mounted { root }
                    | ContainerState::Stopped { root }
                    | ContainerState::Exited { root, .. },
                    true,
                ) => {
                    let root = root.clone();
                    entry.busy = true;
                    Some(root)
                }
                (state, _) => {
                    return Err(Error::InvalidState {
                        container: container.clone(),
                        state: state.name().to_string(),
                        expected: if force {
                            "not running".to_string()
                        } else {
                            "installed".to_string()
                        },
                    });
                }
            }
        };

        if let Some(root) = root {
            if let Err(e) = self.inner.launcher.umount(&root).await {
                self.finish(container, None);
                return Err(e);
            }
        }

        let result = {
            let mut repository = lock(&self.inner.repository);
            repository.remove(container)
        };
        let mut table = write(&self.inner.containers);
        match result {
            Ok(()) => {
                table.remove(container);
            }
            Err(_) => {
                // Keep the entry consistent with the repository.
                if let Some(entry) = table.get_mut(container) {
                    entry.busy = false;
                }
            }
        }
        drop(table);
        result?;
        self.notify(Notification::Uninstalled {
            container: container.clone(),
        });
        Ok(())
    }

    // =========================================================================
    // Mount / Umount
    // =========================================================================

    /// Mounts a set of containers; per-container results, one request.
    pub async fn mount_all(&self, containers: &[Container]) -> Vec<(Container, Result<()>)> {
        let mut results = Vec::with_capacity(containers.len());
        for container in containers {
            results.push((container.clone(), self.mount(container).await));
        }
        results
    }

    /// Umounts a set of containers.
    pub async fn umount_all(&self, containers: &[Container]) -> Vec<(Container, Result<()>)> {
        let mut results = Vec::with_capacity(containers.len());
        for container in containers {
            results.push((container.clone(), self.umount(container).await));
        }
        results
    }

    /// Mounts one container: unpacks and verifies its image.
    pub async fn mount(&self, container: &Container) -> Result<()> {
        self.claim(container, |state| {
            matches!(state, ContainerState::Installed)
        }, "installed")?;

        let npk = {
            let repository = lock(&self.inner.repository);
            match repository.get(container) {
                Some(npk) => npk.clone(),
                None => {
                    self.finish(container, None);
                    return Err(Error::InvalidContainer(container.clone()));
                }
            }
        };
        let target = self
            .inner
            .run_dir
            .join(format!("{}-{}", container.name(), container.version()));

        match self.inner.launcher.mount(&npk, &target).await {
            Ok(root) => {
                self.finish(container, Some(ContainerState::Mounted { root }));
                debug!("mounted {container}");
                Ok(())
            }
            Err(e) => {
                self.finish(container, None);
                Err(e)
            }
        }
    }

    /// Umounts one container.
    ///
    /// Refused while any running container mounts it as a resource.
    pub async fn umount(&self, container: &Container) -> Result<()> {
        // Resource-usage check and the claim happen under one write
        // lock so no user can start in between.
        let root = {
            let mut table = write(&self.inner.containers);
            if let Some(user) = self.resource_user(&table, container) {
                return Err(Error::UmountBusy {
                    container: container.clone(),
                    user,
                });
            }
            let entry = table
                .get_mut(container)
                .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
            if entry.busy {
                return Err(Error::Busy(container.clone()));
            }
            let root = match &entry.state {
                ContainerState::Mounted { root }
                | ContainerState::Stopped { root }
                | ContainerState::Exited { root, .. } => root.clone(),
                state => {
                    return Err(Error::InvalidState {
                        container: container.clone(),
                        state: state.name().to_string(),
                        expected: "mounted, stopped or exited".to_string(),
                    });
                }
            };
            entry.busy = true;
            root
        };

        match self.inner.launcher.umount(&root).await {
            Ok(()) => {
                self.finish(container, Some(ContainerState::Installed));
                debug!("umounted {container}");
                Ok(())
            }
            Err(e) => {
                self.finish(container, None);
                Err(e)
            }
        }
    }

    /// Finds a container in a live state whose manifest mounts
    /// `container` as a resource.
    fn resource_user(
        &self,
        table: &HashMap<Container, Entry>,
        container: &Container,
    ) -> Option<Container> {
        let repository = lock(&self.inner.repository);
        for (user, entry) in table.iter() {
            if !matches!(
                entry.state,
                ContainerState::Starting { .. }
                    | ContainerState::Running { .. }
                    | ContainerState::Stopping { .. }
            ) {
                continue;
            }
            let Some(npk) = repository.get(user) else {
                continue;
            };
            let uses = npk.manifest().resource_mounts().any(|resource| {
                resource.name == *container.name() && resource.version == *container.version()
            });
            if uses {
                return Some(user.clone());
            }
        }
        None
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts a mounted container.
    ///
    /// The sandbox is compiled before anything is spawned; a compile
    /// failure leaves the state at `Mounted`, untouched.
    pub async fn start(&self, container: &Container) -> Result<Process> {
        let manifest = self.manifest(container)?;
        if manifest.is_resource() {
            return Err(Error::StartContainerResource(container.clone()));
        }

        // Claim and resource check under one lock.
        let root = {
            let mut table = write(&self.inner.containers);
            for resource in manifest.resource_mounts() {
                let key = Container::new(resource.name.clone(), resource.version);
                let mounted = table
                    .get(&key)
                    .map(|entry| entry.state.root().is_some())
                    .unwrap_or(false);
                if !mounted {
                    return Err(Error::StartMissingResource {
                        container: container.clone(),
                        name: resource.name.to_string(),
                        version: resource.version.to_string(),
                    });
                }
            }
            let entry = table
                .get_mut(container)
                .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
            if entry.busy {
                return Err(Error::Busy(container.clone()));
            }
            let root = match &entry.state {
                ContainerState::Mounted { root } => root.clone(),
                state => {
                    return Err(Error::InvalidState {
                        container: container.clone(),
                        state: state.name().to_string(),
                        expected: "mounted".to_string(),
                    });
                }
            };
            entry.busy = true;
            entry.state = ContainerState::Starting { root: root.clone() };
            root
        };

        // Expensive, pure, off the lock.
        let spec = match sandbox::compile(&manifest, &self.inner.inventory) {
            Ok(spec) => spec,
            Err(e) => {
                self.finish(container, Some(ContainerState::Mounted { root }));
                return Err(e);
            }
        };

        let init = match &manifest.init {
            Some(init) => init.clone(),
            None => {
                self.finish(container, Some(ContainerState::Mounted { root }));
                return Err(Error::StartContainerResource(container.clone()));
            }
        };
        let config = SpawnConfig {
            root: root.clone(),
            init,
            args: manifest.args.clone(),
            env: manifest.env.clone(),
            uid: manifest.uid,
            gid: manifest.gid,
            io: manifest.io.clone(),
        };

        let spawned = match self.inner.launcher.spawn(&spec, &config).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.finish(container, Some(ContainerState::Mounted { root }));
                return Err(e);
            }
        };

        let pid = spawned.pid;
        self.finish(
            container,
            Some(ContainerState::Running {
                root,
                pid,
                started: Instant::now(),
            }),
        );
        info!("started {container} (pid {pid})");
        self.notify(Notification::Started {
            container: container.clone(),
            pid,
        });
        self.spawn_monitor(container.clone(), spawned);
        Ok(Process {
            pid,
            uptime_secs: 0,
        })
    }

    /// Supervises one running process: forwards cgroup events and
    /// commits the exit transition.
    fn spawn_monitor(&self, container: Container, spawned: Spawned) {
        let engine = self.clone();
        let Spawned { pid, mut events } = spawned;
        tokio::spawn(async move {
            let wait = engine.inner.launcher.wait(pid);
            tokio::pin!(wait);
            let mut events_open = true;
            let status = loop {
                tokio::select! {
                    status = &mut wait => break status,
                    event = events.recv(), if events_open => {
                        match event {
                            Some(event) => {
                                engine.notify(Notification::CGroup {
                                    container: container.clone(),
                                    event,
                                });
                            }
                            None => events_open = false,
                        }
                    }
                }
            };
            // Forward any events that raced the exit.
            while let Ok(event) = events.try_recv() {
                engine.notify(Notification::CGroup {
                    container: container.clone(),
                    event,
                });
            }
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!("wait for {container} (pid {pid}) failed: {e}");
                    ExitStatus::Exit { code: -1 }
                }
            };

            {
                let mut table = write(&engine.inner.containers);
                if let Some(entry) = table.get_mut(&container) {
                    match &entry.state {
                        ContainerState::Stopping { root, .. } => {
                            entry.state = ContainerState::Stopped { root: root.clone() };
                        }
                        ContainerState::Running { root, .. }
                        | ContainerState::Starting { root } => {
                            entry.state = ContainerState::Exited {
                                root: root.clone(),
                                status,
                            };
                        }
                        state => {
                            warn!("{container} exited while {}", state.name());
                        }
                    }
                }
            }
            info!("{container} (pid {pid}) exited with {status}");
            engine.notify(Notification::Exit { container, status });
        });
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stops a running container.
    ///
    /// Sends `signal` (SIGTERM by default), waits up to `timeout` for
    /// the exit, then escalates to SIGKILL. Always resolves: either
    /// with the exit status or with an error if the process survives
    /// even SIGKILL.
    pub async fn stop(
        &self,
        container: &Container,
        signal: Option<i32>,
        timeout: Duration,
    ) -> Result<ExitStatus> {
        // Claim and subscribe under the same lock so the exit
        // notification cannot slip past between the two.
        let (pid, mut rx) = {
            let mut table = write(&self.inner.containers);
            let entry = table
                .get_mut(container)
                .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
            if entry.busy {
                return Err(Error::Busy(container.clone()));
            }
            let (root, pid) = match &entry.state {
                ContainerState::Running { root, pid, .. } => (root.clone(), *pid),
                state => {
                    return Err(Error::InvalidState {
                        container: container.clone(),
                        state: state.name().to_string(),
                        expected: "running".to_string(),
                    });
                }
            };
            entry.busy = true;
            entry.state = ContainerState::Stopping { root, pid };
            (pid, self.inner.notifications.subscribe())
        };

        let result = self.stop_inner(container, pid, signal, timeout, &mut rx).await;
        self.finish(container, None);
        result
    }

    async fn stop_inner(
        &self,
        container: &Container,
        pid: Pid,
        signal: Option<i32>,
        timeout: Duration,
        rx: &mut broadcast::Receiver<Notification>,
    ) -> Result<ExitStatus> {
        let signal = signal.unwrap_or(SIGTERM);
        if let Err(e) = self.inner.launcher.signal(pid, signal).await {
            // The process may have exited on its own; the monitor will
            // still deliver the exit. Keep waiting.
            debug!("signal {signal} to {container}: {e}");
        }

        match tokio::time::timeout(timeout, wait_exit(rx, container)).await {
            Ok(status) => return status,
            Err(_) => {
                warn!("{container} survived signal {signal} for {timeout:?}, sending SIGKILL");
            }
        }

        if let Err(e) = self.inner.launcher.signal(pid, SIGKILL).await {
            debug!("SIGKILL to {container}: {e}");
        }
        match tokio::time::timeout(KILL_REAP_TIMEOUT, wait_exit(rx, container)).await {
            Ok(status) => status,
            Err(_) => Err(Error::StopFailed {
                container: container.clone(),
                pid,
            }),
        }
    }

    // =========================================================================
    // Autostart / Shutdown
    // =========================================================================

    /// Mounts and starts every container whose manifest declares
    /// autostart, in declared order. Failures are logged per container
    /// and never block the rest.
    pub async fn autostart(&self) {
        let mut queue: Vec<(u32, Container)> = {
            let repository = lock(&self.inner.repository);
            repository
                .iter()
                .filter_map(|(container, npk)| {
                    npk.manifest()
                        .autostart
                        .map(|autostart| (autostart.order, container.clone()))
                })
                .collect()
        };
        queue.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, container) in queue {
            info!("autostarting {container}");
            if let Err(e) = self.mount(&container).await {
                warn!("autostart: mount {container}: {e}");
                continue;
            }
            if let Err(e) = self.start(&container).await {
                warn!("autostart: start {container}: {e}");
            }
        }
    }

    /// Stops every running container, umounts everything, and
    /// broadcasts the shutdown.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let containers: Vec<Container> = {
            let table = read(&self.inner.containers);
            table.keys().cloned().collect()
        };

        for container in &containers {
            let running = {
                let table = read(&self.inner.containers);
                matches!(
                    table.get(container).map(|e| &e.state),
                    Some(ContainerState::Running { .. })
                )
            };
            if running {
                if let Err(e) = self.stop(container, None, timeout).await {
                    warn!("shutdown: stop {container}: {e}");
                }
            }
        }
        for container in &containers {
            let mounted = {
                let table = read(&self.inner.containers);
                table
                    .get(container)
                    .map(|e| e.state.root().is_some())
                    .unwrap_or(false)
            };
            if mounted {
                if let Err(e) = self.umount(container).await {
                    warn!("shutdown: umount {container}: {e}");
                }
            }
        }

        self.notify(Notification::Shutdown);
        info!("engine down");
        Ok(())
    }

    // =========================================================================
    // Claim / Finish
    // =========================================================================

    /// Claims a container for a transition: must exist, not be busy,
    /// and be in an admissible state.
    fn claim(
        &self,
        container: &Container,
        admissible: impl Fn(&ContainerState) -> bool,
        expected: &str,
    ) -> Result<()> {
        let mut table = write(&self.inner.containers);
        let entry = table
            .get_mut(container)
            .ok_or_else(|| Error::InvalidContainer(container.clone()))?;
        if entry.busy {
            return Err(Error::Busy(container.clone()));
        }
        if !admissible(&entry.state) {
            return Err(Error::InvalidState {
                container: container.clone(),
                state: entry.state.name().to_string(),
                expected: expected.to_string(),
            });
        }
        entry.busy = true;
        Ok(())
    }

    /// Releases a claim, optionally committing a new state.
    fn finish(&self, container: &Container, state: Option<ContainerState>) {
        let mut table = write(&self.inner.containers);
        if let Some(entry) = table.get_mut(container) {
            entry.busy = false;
            if let Some(state) = state {
                entry.state = state;
            }
        }
    }
}

/// Awaits the exit notification for one container.
async fn wait_exit(
    rx: &mut broadcast::Receiver<Notification>,
    container: &Container,
) -> Result<ExitStatus> {
    loop {
        match rx.recv().await {
            Ok(Notification::Exit {
                container: exited,
                status,
            }) if exited == *container => return Ok(status),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("notification stream lagged by {n}, still waiting for exit");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Shutdown("notification channel closed".to_string()));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
