//! Unix socket server dispatching each received message to a handler.

use async_trait::async_trait;
use futures::FutureExt;
use mist_protocol::{ErrorPayload, Message, MessageType, ProtocolError, BROKER_ID};
use std::os::unix::fs::PermissionsExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Frame};
use crate::error::TransportError;

/// Receives every message decoded by a [`Server`].
///
/// Calls for one connection happen in arrival order, one at a time;
/// different connections are served concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message, conn: &Connection);

    /// A line on `conn` failed to decode. The connection stays open.
    async fn on_malformed(&self, err: &ProtocolError, conn: &Connection) {
        let payload = serde_json::to_value(ErrorPayload::new(err.to_string()))
            .unwrap_or(serde_json::Value::Null);
        let reply = Message::create(MessageType::Error, BROKER_ID, "", payload);
        if let Err(e) = conn.send(&reply).await {
            debug!(conn = %conn.id(), "could not report malformed frame: {}", e);
        }
    }

    /// `conn` is gone: peer EOF, read failure, or server stop.
    async fn on_disconnect(&self, _conn: &Connection) {}
}

/// A bound, not yet serving, socket.
pub struct Server<H> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<H>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<H: MessageHandler> Server<H> {
    /// Bind with owner-only permissions (`0o600`).
    pub async fn bind(path: &Path, handler: Arc<H>) -> Result<Self, TransportError> {
        Self::bind_with_mode(path, handler, 0o600).await
    }

    /// Bind at `path`, replacing a stale socket file from an earlier run.
    /// A freshly created parent directory gets mode `0o700`.
    pub async fn bind_with_mode(
        path: &Path,
        handler: Arc<H>,
        mode: u32,
    ) -> Result<Self, TransportError> {
        if path.exists() {
            debug!("removing stale socket {:?}", path);
            std::fs::remove_file(path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        info!("listening on {:?}", path);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handler,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Token that ends [`Server::serve_forever`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve on a background task.
    pub fn start(self) -> ServerHandle {
        let cancel = self.cancel.clone();
        let path = self.path.clone();
        let task = tokio::spawn(self.serve_forever());
        ServerHandle { cancel, path, task }
    }

    /// Accept until the shutdown token fires, then cancel every connection
    /// task, wait for them and remove the socket file.
    pub async fn serve_forever(self) {
        let Server {
            listener,
            path,
            handler,
            cancel,
            tracker,
        } = self;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tracker.spawn(serve_connection(stream, handler.clone(), cancel.child_token()));
                    }
                    Err(e) => error!("accept error: {}", e),
                },
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        remove_socket(&path);
        info!("server on {:?} stopped", path);
    }
}

/// Handle to a server started with [`Server::start`].
pub struct ServerHandle {
    cancel: CancellationToken,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting, cancel in-flight handlers at their next await point,
    /// close every connection and remove the socket file.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("server task ended abnormally: {}", e);
            remove_socket(&self.path);
        }
    }
}

pub fn remove_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

async fn serve_connection<H: MessageHandler>(
    stream: UnixStream,
    handler: Arc<H>,
    cancel: CancellationToken,
) {
    let (conn, mut reader) = Connection::from_stream(stream);
    debug!(conn = %conn.id(), "connection opened");

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(Frame::Message(msg))) => {
                let msg_type = msg.msg_type.clone();
                let dispatch = AssertUnwindSafe(handler.handle(msg, &conn)).catch_unwind();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = dispatch => {
                        if result.is_err() {
                            error!(conn = %conn.id(), msg_type = %msg_type, "handler panicked");
                        }
                    }
                }
            }
            Ok(Some(Frame::Malformed(err))) => {
                warn!(conn = %conn.id(), "malformed message: {}", err);
                handler.on_malformed(&err, &conn).await;
            }
            Ok(None) => {
                debug!(conn = %conn.id(), "peer closed");
                break;
            }
            Err(e) => {
                warn!(conn = %conn.id(), "read error: {}", e);
                break;
            }
        }
    }

    conn.close().await;
    handler.on_disconnect(&conn).await;
}
