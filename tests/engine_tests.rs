//! Tests for the lifecycle engine.
//!
//! Exercises the state machine end to end over a mock launcher: no
//! kernel interaction, full control over process lifetime.

use canister::api::model::{ExitStatus, Notification};
use canister::container::{Container, Name, Version};
use canister::engine::{Engine, EngineConfig};
use canister::error::Error;
use canister::launcher::MockLauncher;
use canister::manifest::{
    Autostart, Capability, Manifest, MemoryResources, Mount, Resource,
};
use canister::platform::KernelInventory;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

// =============================================================================
// Helpers
// =============================================================================

fn manifest(name: &str, edit: impl FnOnce(&mut Manifest)) -> Manifest {
    let mut manifest = Manifest {
        name: Name::try_from(name).unwrap(),
        version: Version::new(0, 0, 1),
        init: Some(PathBuf::from("/init")),
        args: Vec::new(),
        env: Default::default(),
        uid: 1000,
        gid: 1000,
        cpu: None,
        memory: None,
        blkio: None,
        mounts: BTreeMap::new(),
        capabilities: Default::default(),
        rlimits: Default::default(),
        seccomp: None,
        selinux: None,
        console: None,
        autostart: None,
        io: None,
    };
    edit(&mut manifest);
    manifest
}

fn make_npk(dir: &Path, manifest: &Manifest) -> PathBuf {
    let root = dir.join(format!("{}-rootfs", manifest.name));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("init"), b"#!/bin/sh\n").unwrap();
    canister::npk::pack(manifest, &root, dir).unwrap()
}

fn engine(dir: &TempDir, launcher: Arc<MockLauncher>, inventory: KernelInventory) -> Engine {
    let config = EngineConfig {
        run_dir: dir.path().join("run"),
        repository_dir: dir.path().join("repository"),
    };
    Engine::new(config, launcher, inventory).unwrap()
}

fn state_of(engine: &Engine, container: &Container) -> String {
    engine
        .containers()
        .into_iter()
        .find(|data| data.container == *container)
        .map(|data| data.state)
        .unwrap_or_else(|| "not_installed".to_string())
}

async fn wait_for_exit(
    rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    container: &Container,
) -> ExitStatus {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Ok(Notification::Exit {
                container: exited,
                status,
            }) if exited == *container => return status,
            Ok(_) => {}
            Err(e) => panic!("notification stream: {e}"),
        }
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let mut notifications = engine.subscribe();

    let container = engine.install(&npk).await.unwrap();
    assert_eq!(state_of(&engine, &container), "installed");
    assert!(matches!(
        timeout(Duration::from_secs(1), notifications.recv())
            .await
            .unwrap(),
        Ok(Notification::Installed { .. })
    ));

    engine.mount(&container).await.unwrap();
    assert_eq!(state_of(&engine, &container), "mounted");

    let process = engine.start(&container).await.unwrap();
    assert_eq!(state_of(&engine, &container), "running");
    assert!(matches!(
        timeout(Duration::from_secs(1), notifications.recv())
            .await
            .unwrap(),
        Ok(Notification::Started { pid, .. }) if pid == process.pid
    ));

    let status = engine
        .stop(&container, None, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, ExitStatus::Signalled { signal: 15 });
    assert_eq!(state_of(&engine, &container), "stopped");

    engine.umount(&container).await.unwrap();
    assert_eq!(state_of(&engine, &container), "installed");

    engine.uninstall(&container, false).await.unwrap();
    assert_eq!(state_of(&engine, &container), "not_installed");
}

#[tokio::test]
async fn test_start_requires_mounted() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    assert!(matches!(
        engine.start(&container).await,
        Err(Error::InvalidState { .. })
    ));
    // Stopped containers must umount before restarting.
    assert_eq!(state_of(&engine, &container), "installed");
}

#[tokio::test]
async fn test_unknown_container_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let container = Container::try_from("ghost:1.0.0").unwrap();
    assert!(matches!(
        engine.mount(&container).await,
        Err(Error::InvalidContainer(_))
    ));
}

#[tokio::test]
async fn test_install_duplicate_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    engine.install(&npk).await.unwrap();
    assert!(matches!(
        engine.install(&npk).await,
        Err(Error::InstallDuplicate(_))
    ));
}

#[tokio::test]
async fn test_self_exit_moves_to_exited() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    let process = engine.start(&container).await.unwrap();

    let mut notifications = engine.subscribe();
    launcher.exit(process.pid, ExitStatus::Exit { code: 0 });
    let status = wait_for_exit(&mut notifications, &container).await;
    assert_eq!(status, ExitStatus::Exit { code: 0 });
    assert_eq!(state_of(&engine, &container), "exited");

    // An exited container umounts back to installed.
    engine.umount(&container).await.unwrap();
    assert_eq!(state_of(&engine, &container), "installed");
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test]
async fn test_concurrent_stop_one_wins() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    let (first, second) = tokio::join!(
        engine.stop(&container, None, Duration::from_secs(5)),
        engine.stop(&container, None, Duration::from_secs(5)),
    );
    let results = [first, second];
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Busy(_))))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(busy, 1);
    assert_eq!(state_of(&engine, &container), "stopped");
}

#[tokio::test]
async fn test_stop_while_starting_is_busy_or_invalid() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();

    let (started, stopped) = tokio::join!(
        engine.start(&container),
        engine.stop(&container, None, Duration::from_secs(1)),
    );
    assert!(started.is_ok());
    // The stop raced a start. Either it lost the race and was rejected
    // outright (never queued), or the start had already committed and
    // the stop ran as a normal stop. Nothing in between.
    match stopped {
        Ok(_) => assert_eq!(state_of(&engine, &container), "stopped"),
        Err(Error::Busy(_)) | Err(Error::InvalidState { .. }) => {
            assert_eq!(state_of(&engine, &container), "running");
        }
        Err(e) => panic!("unexpected stop outcome: {e}"),
    }
}

// =============================================================================
// Stop Escalation Tests
// =============================================================================

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let dir = TempDir::new().unwrap();
    // SIGTERM is ignored; only SIGKILL terminates.
    let launcher = Arc::new(MockLauncher::with_ignored_signals(vec![15]));
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("stubborn", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    let started = std::time::Instant::now();
    let status = engine
        .stop(&container, None, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    // SIGKILL terminates the mock immediately, so the whole stop
    // resolves well inside the kill grace period.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(status, ExitStatus::Signalled { signal: 9 });
    assert_eq!(state_of(&engine, &container), "stopped");
}

#[tokio::test(start_paused = true)]
async fn test_unreapable_process_fails_stop() {
    let dir = TempDir::new().unwrap();
    // Nothing terminates this one, not even SIGKILL.
    let launcher = Arc::new(MockLauncher::with_ignored_signals(vec![15, 9]));
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("zombie", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    let result = engine
        .stop(&container, None, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::StopFailed { .. })));
    assert_eq!(state_of(&engine, &container), "stopping");
    // The claim is released: a second stop is rejected on state, not
    // reported busy.
    assert!(matches!(
        engine.stop(&container, None, Duration::from_millis(100)).await,
        Err(Error::InvalidState { .. })
    ));
}

// =============================================================================
// Sandbox Integration Tests
// =============================================================================

#[tokio::test]
async fn test_memory_limit_reaches_launcher() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(
        dir.path(),
        &manifest("app", |m| {
            m.version = Version::new(1, 0, 0);
            m.memory = Some(MemoryResources {
                limit: Some(64 * 1024 * 1024),
            });
        }),
    );

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();
    assert_eq!(state_of(&engine, &container), "running");

    let specs = launcher.spawned_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].cgroups.get("memory.max"), Some("67108864"));
}

#[tokio::test]
async fn test_unsupported_capability_leaves_mounted() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let mut inventory = KernelInventory::all();
    inventory.capabilities.remove(&Capability::CAP_SYS_ADMIN);
    let engine = engine(&dir, launcher.clone(), inventory);
    let npk = make_npk(
        dir.path(),
        &manifest("privileged", |m| {
            m.capabilities.insert(Capability::CAP_SYS_ADMIN);
        }),
    );

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    assert!(matches!(
        engine.start(&container).await,
        Err(Error::UnsupportedCapability(_))
    ));
    // Compile failure must not touch the state, and nothing spawned.
    assert_eq!(state_of(&engine, &container), "mounted");
    assert!(launcher.spawned_specs().is_empty());
}

// =============================================================================
// Resource Container Tests
// =============================================================================

fn resource_manifest(name: &str) -> Manifest {
    manifest(name, |m| {
        m.init = None;
    })
}

#[tokio::test]
async fn test_resource_container_cannot_start() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &resource_manifest("data"));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    assert!(matches!(
        engine.start(&container).await,
        Err(Error::StartContainerResource(_))
    ));
}

#[tokio::test]
async fn test_start_requires_mounted_resources() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let app = make_npk(
        dir.path(),
        &manifest("app", |m| {
            m.mounts.insert(
                PathBuf::from("/res"),
                Mount::Resource(Resource {
                    name: Name::try_from("data").unwrap(),
                    version: Version::new(0, 0, 1),
                    dir: PathBuf::from("/"),
                    options: Default::default(),
                }),
            );
        }),
    );
    let data = make_npk(dir.path(), &resource_manifest("data"));

    let app = engine.install(&app).await.unwrap();
    let data = engine.install(&data).await.unwrap();
    engine.mount(&app).await.unwrap();

    // Resource not mounted yet.
    assert!(matches!(
        engine.start(&app).await,
        Err(Error::StartMissingResource { .. })
    ));

    engine.mount(&data).await.unwrap();
    engine.start(&app).await.unwrap();
    assert_eq!(state_of(&engine, &app), "running");
}

#[tokio::test]
async fn test_umount_refused_while_resource_in_use() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let app = make_npk(
        dir.path(),
        &manifest("app", |m| {
            m.mounts.insert(
                PathBuf::from("/res"),
                Mount::Resource(Resource {
                    name: Name::try_from("data").unwrap(),
                    version: Version::new(0, 0, 1),
                    dir: PathBuf::from("/"),
                    options: Default::default(),
                }),
            );
        }),
    );
    let data = make_npk(dir.path(), &resource_manifest("data"));

    let app = engine.install(&app).await.unwrap();
    let data = engine.install(&data).await.unwrap();
    engine.mount(&data).await.unwrap();
    engine.mount(&app).await.unwrap();
    engine.start(&app).await.unwrap();

    assert!(matches!(
        engine.umount(&data).await,
        Err(Error::UmountBusy { .. })
    ));

    engine
        .stop(&app, None, Duration::from_secs(5))
        .await
        .unwrap();
    engine.umount(&data).await.unwrap();
}

// =============================================================================
// Uninstall Tests
// =============================================================================

#[tokio::test]
async fn test_uninstall_running_always_refused() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    // Even forced: stop first, then uninstall.
    assert!(matches!(
        engine.uninstall(&container, true).await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(state_of(&engine, &container), "running");
}

#[tokio::test]
async fn test_uninstall_excludes_concurrent_mount() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();

    // Whatever the interleaving, at most one of the pair may succeed:
    // a mount claimed mid-uninstall would produce a root the engine no
    // longer tracks.
    let (uninstalled, mounted) = tokio::join!(
        engine.uninstall(&container, false),
        engine.mount(&container),
    );
    assert!(!(uninstalled.is_ok() && mounted.is_ok()));
    if uninstalled.is_ok() {
        assert_eq!(state_of(&engine, &container), "not_installed");
    } else {
        assert_eq!(state_of(&engine, &container), "mounted");
    }
}

#[tokio::test]
async fn test_forced_uninstall_umounts_first() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();

    // Unforced is refused while mounted.
    assert!(matches!(
        engine.uninstall(&container, false).await,
        Err(Error::InvalidState { .. })
    ));
    engine.uninstall(&container, true).await.unwrap();
    assert_eq!(state_of(&engine, &container), "not_installed");
}

// =============================================================================
// Autostart Tests
// =============================================================================

#[tokio::test]
async fn test_autostart_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let mut inventory = KernelInventory::all();
    inventory.capabilities.remove(&Capability::CAP_SYS_ADMIN);

    // First in order fails sandbox compilation; second must still
    // come up.
    let broken = make_npk(
        dir.path(),
        &manifest("broken", |m| {
            m.autostart = Some(Autostart { order: 0 });
            m.capabilities.insert(Capability::CAP_SYS_ADMIN);
        }),
    );
    let healthy = make_npk(
        dir.path(),
        &manifest("healthy", |m| {
            m.autostart = Some(Autostart { order: 1 });
        }),
    );

    let engine = engine(&dir, launcher.clone(), inventory);
    let broken = engine.install(&broken).await.unwrap();
    let healthy = engine.install(&healthy).await.unwrap();

    engine.autostart().await;
    assert_eq!(state_of(&engine, &broken), "mounted");
    assert_eq!(state_of(&engine, &healthy), "running");
}

#[tokio::test]
async fn test_repository_scan_restores_installed_state() {
    let dir = TempDir::new().unwrap();
    let npk = make_npk(dir.path(), &manifest("hello", |_| {}));
    let container;
    {
        let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
        container = engine.install(&npk).await.unwrap();
    }

    // A fresh engine over the same repository finds the container.
    let engine = engine(&dir, Arc::new(MockLauncher::new()), KernelInventory::all());
    assert_eq!(state_of(&engine, &container), "installed");
}

// =============================================================================
// Cgroup Notification Tests
// =============================================================================

#[tokio::test]
async fn test_memory_events_are_broadcast() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let engine = engine(&dir, launcher.clone(), KernelInventory::all());
    let npk = make_npk(dir.path(), &manifest("hungry", |_| {}));

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    let process = engine.start(&container).await.unwrap();

    let mut notifications = engine.subscribe();
    launcher
        .push_memory_event(
            process.pid,
            canister::api::model::MemoryNotification { oom: 1, oom_kill: 0 },
        )
        .await;

    loop {
        match timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Notification::CGroup {
                container: source,
                event,
            } => {
                assert_eq!(source, container);
                assert_eq!(
                    event,
                    canister::api::model::CgroupNotification::Memory(
                        canister::api::model::MemoryNotification { oom: 1, oom_kill: 0 }
                    )
                );
                break;
            }
            _ => {}
        }
    }
}
