//! Tests for the console protocol layer.
//!
//! Drives full connections over in-memory duplex streams: framing,
//! FIFO request/response pairing, and notification fan-out.

use canister::api::codec::{read_message, write_message, FrameDecoder};
use canister::api::model::{Message, Notification, Request, Response};
use canister::console::Console;
use canister::container::{Name, Version};
use canister::engine::{Engine, EngineConfig};
use canister::launcher::MockLauncher;
use canister::manifest::Manifest;
use canister::platform::KernelInventory;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::time::timeout;

// =============================================================================
// Helpers
// =============================================================================

fn make_npk(dir: &Path, name: &str) -> PathBuf {
    let manifest = Manifest {
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
        mounts: Default::default(),
        capabilities: Default::default(),
        rlimits: Default::default(),
        seccomp: None,
        selinux: None,
        console: None,
        autostart: None,
        io: None,
    };
    let root = dir.join(format!("{name}-rootfs"));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("init"), b"#!/bin/sh\n").unwrap();
    canister::npk::pack(&manifest, &root, dir).unwrap()
}

fn console(dir: &TempDir) -> (Console, Engine) {
    let config = EngineConfig {
        run_dir: dir.path().join("run"),
        repository_dir: dir.path().join("repository"),
    };
    let engine = Engine::new(config, Arc::new(MockLauncher::new()), KernelInventory::all()).unwrap();
    (Console::new(engine.clone()), engine)
}

struct Client<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            decoder: FrameDecoder::default(),
            buffer: BytesMut::new(),
        }
    }

    async fn send(&mut self, request: Request)
    where
        S: Unpin,
    {
        write_message(&mut self.writer, &Message::Request(request))
            .await
            .unwrap();
    }

    /// Next response, skipping interleaved notifications.
    async fn response(&mut self) -> Response
    where
        S: Unpin,
    {
        loop {
            let message = timeout(
                Duration::from_secs(5),
                read_message(&mut self.reader, &self.decoder, &mut self.buffer),
            )
            .await
            .unwrap()
            .unwrap();
            match message {
                Message::Response(response) => return response,
                Message::Notification(_) => continue,
                Message::Request(_) => panic!("server sent a request"),
            }
        }
    }

    /// Next notification, skipping responses.
    async fn notification(&mut self) -> Notification
    where
        S: Unpin,
    {
        loop {
            let message = timeout(
                Duration::from_secs(5),
                read_message(&mut self.reader, &self.decoder, &mut self.buffer),
            )
            .await
            .unwrap()
            .unwrap();
            if let Message::Notification(notification) = message {
                return notification;
            }
        }
    }
}

// =============================================================================
// FIFO Ordering Tests
// =============================================================================

#[tokio::test]
async fn test_three_requests_three_ordered_responses() {
    let dir = TempDir::new().unwrap();
    let (console, _engine) = console(&dir);
    let npk = make_npk(dir.path(), "hello");

    let (client, server) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server);
    let mut client = Client::new(client);

    // Back-to-back, no waiting in between. The install is the slow
    // one; ordering must hold regardless.
    client.send(Request::Containers).await;
    client.send(Request::Install { npk }).await;
    client.send(Request::Containers).await;

    let first = client.response().await;
    let second = client.response().await;
    let third = client.response().await;

    match first {
        Response::Containers { containers } => assert!(containers.is_empty()),
        other => panic!("expected empty container list, got {other:?}"),
    }
    assert!(matches!(second, Response::Install { .. }));
    match third {
        Response::Containers { containers } => assert_eq!(containers.len(), 1),
        other => panic!("expected one container, got {other:?}"),
    }
}

#[tokio::test]
async fn test_error_response_keeps_connection_alive() {
    let dir = TempDir::new().unwrap();
    let (console, _engine) = console(&dir);

    let (client, server) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server);
    let mut client = Client::new(client);

    client
        .send(Request::Install {
            npk: PathBuf::from("/does/not/exist.npk"),
        })
        .await;
    assert!(matches!(client.response().await, Response::Error { .. }));

    // Connection still serves requests.
    client.send(Request::Containers).await;
    assert!(matches!(
        client.response().await,
        Response::Containers { .. }
    ));
}

// =============================================================================
// Notification Fan-Out Tests
// =============================================================================

#[tokio::test]
async fn test_notifications_reach_all_connections() {
    let dir = TempDir::new().unwrap();
    let (console, _engine) = console(&dir);
    let npk = make_npk(dir.path(), "hello");

    let (client_a, server_a) = tokio::io::duplex(64 * 1024);
    let (client_b, server_b) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server_a);
    console.spawn_connection(server_b);
    let mut client_a = Client::new(client_a);
    let mut client_b = Client::new(client_b);

    // Install via connection A; both A and B observe the event.
    client_a.send(Request::Install { npk }).await;
    assert!(matches!(
        client_a.response().await,
        Response::Install { .. }
    ));

    assert!(matches!(
        client_a.notification().await,
        Notification::Installed { .. }
    ));
    assert!(matches!(
        client_b.notification().await,
        Notification::Installed { .. }
    ));
}

#[tokio::test]
async fn test_stop_response_carries_exit_status() {
    let dir = TempDir::new().unwrap();
    let (console, engine) = console(&dir);
    let npk = make_npk(dir.path(), "hello");

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server);
    let mut client = Client::new(client);

    client
        .send(Request::Stop {
            container,
            signal: None,
            timeout_secs: 5,
        })
        .await;
    match client.response().await {
        Response::Stop { status } => {
            assert_eq!(
                status,
                canister::api::model::ExitStatus::Signalled { signal: 15 }
            );
        }
        other => panic!("expected stop response, got {other:?}"),
    }
}

// =============================================================================
// Protocol Robustness Tests
// =============================================================================

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    use tokio::io::AsyncWriteExt;

    let dir = TempDir::new().unwrap();
    let (console, _engine) = console(&dir);

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server);

    // Length prefix far above the frame cap; the server must drop the
    // connection instead of buffering.
    client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    client.flush().await.unwrap();

    let mut buffer = [0u8; 16];
    use tokio::io::AsyncReadExt;
    let n = timeout(Duration::from_secs(5), client.read(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "expected eof after protocol violation");
}

#[tokio::test]
async fn test_shutdown_request() {
    let dir = TempDir::new().unwrap();
    let (console, engine) = console(&dir);
    let npk = make_npk(dir.path(), "hello");

    let container = engine.install(&npk).await.unwrap();
    engine.mount(&container).await.unwrap();
    engine.start(&container).await.unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    console.spawn_connection(server);
    let mut client = Client::new(client);

    client.send(Request::Shutdown).await;
    assert!(matches!(client.response().await, Response::Ok));

    // Everything was stopped and umounted.
    let data = engine.containers();
    assert!(data.iter().all(|d| d.state == "installed"));
}
