//! # Console
//!
//! Serves the control protocol over framed byte streams. Each
//! connection runs in its own task:
//!
//! - requests are decoded, handled and answered strictly in arrival
//!   order, one at a time, so every connection sees FIFO
//!   request/response pairing without correlation ids
//! - notifications from the engine broadcast interleave with
//!   responses whenever the connection is not mid-request
//!
//! A slow client only ever backs up its own connection. Notifications
//! it cannot keep up with are dropped for that connection (with a
//! warning); the shared engine is never blocked.

use crate::api::codec::{read_message, write_message, FrameDecoder};
use crate::api::model::{self, Message, MountResult, Notification, Request, Response, UmountResult};
use crate::constants::DEFAULT_STOP_TIMEOUT;
use crate::engine::Engine;
use crate::error::{Error, Result};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Protocol server over the lifecycle engine.
#[derive(Clone)]
pub struct Console {
    engine: Engine,
}

impl Console {
    pub fn new(engine: Engine) -> Console {
        Console { engine }
    }

    /// Accepts connections on a unix socket until the engine shuts
    /// down. A stale socket file is replaced.
    #[cfg(unix)]
    pub async fn serve_unix(&self, path: &std::path::Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| Error::io(format!("remove stale socket {}", path.display()), e))?;
        }
        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|e| Error::io(format!("bind {}", path.display()), e))?;
        info!("console listening on {}", path.display());

        let mut shutdown = self.engine.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(|e| Error::io("accept", e))?;
                    self.spawn_connection(stream);
                }
                notification = shutdown.recv() => {
                    match notification {
                        Ok(Notification::Shutdown) => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs one connection in a background task.
    ///
    /// The notification subscription is taken here, before the task is
    /// spawned, so events broadcast between accept and the task's first
    /// poll are not lost.
    pub fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let console = self.clone();
        let notifications = self.engine.subscribe();
        tokio::spawn(async move {
            if let Err(e) = console.connection(stream, notifications).await {
                match e {
                    Error::ConnectionClosed => debug!("connection closed"),
                    e => warn!("connection error: {e}"),
                }
            }
        });
    }

    /// Connection loop: strictly sequential request handling,
    /// notifications interleaved between requests.
    pub async fn connection<S>(
        &self,
        stream: S,
        mut notifications: broadcast::Receiver<Notification>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let decoder = FrameDecoder::default();
        let mut buffer = BytesMut::new();

        loop {
            tokio::select! {
                message = read_message(&mut reader, &decoder, &mut buffer) => {
                    let request = match message? {
                        Message::Request(request) => request,
                        _ => {
                            let error = model::Error::Internal {
                                message: "expected a request".to_string(),
                            };
                            write_message(&mut writer, &Message::Response(Response::Error { error })).await?;
                            continue;
                        }
                    };
                    let shutdown = matches!(request, Request::Shutdown);
                    let response = self.handle(request).await;
                    write_message(&mut writer, &Message::Response(response)).await?;
                    if shutdown {
                        return Ok(());
                    }
                }
                notification = notifications.recv() => {
                    match notification {
                        Ok(notification) => {
                            write_message(&mut writer, &Message::Notification(notification)).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("connection lagged, dropped {n} notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Maps one request onto the engine. Infallible: engine errors
    /// become error responses.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Containers => Response::Containers {
                containers: self.engine.containers(),
            },
            Request::Install { npk } => match self.engine.install(&npk).await {
                Ok(container) => Response::Install { container },
                Err(e) => error_response(&e),
            },
            Request::Uninstall { container, force } => {
                match self.engine.uninstall(&container, force).await {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(&e),
                }
            }
            Request::Mount { containers } => {
                let results = self
                    .engine
                    .mount_all(&containers)
                    .await
                    .into_iter()
                    .map(|(container, result)| match result {
                        Ok(()) => MountResult::Ok { container },
                        Err(e) => MountResult::Error {
                            container,
                            error: (&e).into(),
                        },
                    })
                    .collect();
                Response::Mount { results }
            }
            Request::Umount { containers } => {
                let results = self
                    .engine
                    .umount_all(&containers)
                    .await
                    .into_iter()
                    .map(|(container, result)| match result {
                        Ok(()) => UmountResult::Ok { container },
                        Err(e) => UmountResult::Error {
                            container,
                            error: (&e).into(),
                        },
                    })
                    .collect();
                Response::Umount { results }
            }
            Request::Start { container } => match self.engine.start(&container).await {
                Ok(process) => Response::Start { process },
                Err(e) => error_response(&e),
            },
            Request::Stop {
                container,
                signal,
                timeout_secs,
            } => {
                let timeout = if timeout_secs == 0 {
                    DEFAULT_STOP_TIMEOUT
                } else {
                    Duration::from_secs(timeout_secs)
                };
                match self.engine.stop(&container, signal, timeout).await {
                    Ok(status) => Response::Stop { status },
                    Err(e) => error_response(&e),
                }
            }
            Request::Shutdown => match self.engine.shutdown(DEFAULT_STOP_TIMEOUT).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            },
        }
    }
}

fn error_response(error: &Error) -> Response {
    Response::Error {
        error: error.into(),
    }
}
