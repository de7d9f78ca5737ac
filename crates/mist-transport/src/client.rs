//! Outbound connection with request/response correlation.
//!
//! A [`Client`] owns one [`Connection`] and a background reader task. The
//! reader routes each incoming message by `correlates_to`:
//!
//! 1. a pending [`Client::request`] with that id is fulfilled and removed,
//! 2. else a registered reply stream with that id receives it,
//! 3. else it goes to the unsolicited channel, if one is attached, or is
//!    dropped.

use futures::StreamExt;
use mist_protocol::{Message, MessageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, Frame, MessageReader};
use crate::error::TransportError;

/// Lifecycle of a [`Client`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Shared {
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    streams: Mutex<HashMap<MessageId, mpsc::UnboundedSender<Message>>>,
    unsolicited: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<ClientState>,
}

impl Shared {
    fn dispatch(&self, msg: Message) {
        if let Some(cid) = msg.correlates_to.clone() {
            let waiter = self.pending.lock().remove(&cid);
            if let Some(tx) = waiter {
                let _ = tx.send(msg);
                return;
            }

            let mut streams = self.streams.lock();
            if let Some(tx) = streams.get(&cid) {
                let finished = msg.msg_type.is_terminal_reply();
                if tx.send(msg).is_err() || finished {
                    streams.remove(&cid);
                }
                return;
            }
        }

        let hook = self.unsolicited.lock().clone();
        match hook {
            Some(tx) => {
                if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                    debug!(msg_type = %msg.msg_type, "unsolicited receiver gone, dropping");
                }
            }
            None => debug!(msg_type = %msg.msg_type, id = %msg.id, "dropping uncorrelated message"),
        }
    }

    /// Drop every waiter; their receivers observe `Closed`.
    fn clear(&self) {
        self.pending.lock().clear();
        self.streams.lock().clear();
    }

    /// Atomically move from any state in `from` to `to`.
    fn transition(
        &self,
        operation: &'static str,
        from: &[ClientState],
        to: ClientState,
    ) -> Result<(), TransportError> {
        let mut current = to;
        let moved = self.state.send_if_modified(|state| {
            current = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(TransportError::InvalidState {
                operation,
                state: current,
            })
        }
    }
}

/// Removes a pending entry when the request future completes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Replies correlated to one request id, delivered in arrival order.
///
/// Ends after the first terminal reply (anything but `stream.chunk`) or when
/// the client closes. Dropping it unregisters the stream.
pub struct ReplyStream {
    id: MessageId,
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

impl ReplyStream {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Like [`ReplyStream::next`] with a per-reply deadline.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Message, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                id: self.id.clone(),
                after: timeout,
            }),
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.id);
    }
}

/// Transport client for one Unix socket.
pub struct Client {
    path: PathBuf,
    shared: Arc<Shared>,
    conn: Mutex<Option<Connection>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            path: path.into(),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                unsolicited: Mutex::new(None),
                state,
            }),
            conn: Mutex::new(None),
            reader_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Route uncorrelated messages to the returned receiver. Replaces any
    /// earlier receiver.
    pub fn subscribe_unsolicited(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.unsolicited.lock() = Some(tx);
        rx
    }

    /// Open the socket and start the reader task.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.shared
            .transition("connect", &[ClientState::Disconnected], ClientState::Connecting)?;

        let (conn, reader) = match Connection::connect(&self.path).await {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.state.send_replace(ClientState::Disconnected);
                return Err(e);
            }
        };
        debug!(conn = %conn.id(), "connected to {:?}", self.path);
        self.attach(conn, reader).await
    }

    /// Start the reader for a fresh connection and finish `Connecting`.
    /// If close() won the race, tear down what this call set up.
    async fn attach(&self, conn: Connection, reader: MessageReader) -> Result<(), TransportError> {
        let task = tokio::spawn(read_loop(
            self.shared.clone(),
            conn.clone(),
            reader,
            self.cancel.clone(),
        ));
        *self.conn.lock() = Some(conn);
        *self.reader_task.lock() = Some(task);

        if self
            .shared
            .transition("connect", &[ClientState::Connecting], ClientState::Connected)
            .is_err()
        {
            self.cancel.cancel();
            let task = self.reader_task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!("reader task ended abnormally: {}", e);
                }
            }
            let conn = self.conn.lock().take();
            if let Some(conn) = conn {
                conn.close().await;
            }
            self.shared.clear();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn connection(&self) -> Result<Connection, TransportError> {
        let state = self.state();
        if state != ClientState::Connected {
            return Err(TransportError::NotConnected(state));
        }
        self.conn.lock().clone().ok_or(TransportError::Closed)
    }

    /// Write without waiting for a reply.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        self.connection()?.send(msg).await
    }

    /// Send `msg` and wait for the reply correlated to its id.
    pub async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, TransportError> {
        let conn = self.connection()?;
        let id = msg.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&id) {
                return Err(TransportError::DuplicateRequest(id));
            }
            pending.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        conn.send(&msg).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                debug!(%id, "request timed out after {:?}", timeout);
                Err(TransportError::Timeout { id, after: timeout })
            }
        }
    }

    /// Register a reply stream for `id` without sending anything.
    pub fn open_stream(&self, id: &MessageId) -> Result<ReplyStream, TransportError> {
        let state = self.state();
        if state != ClientState::Connected {
            return Err(TransportError::NotConnected(state));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.shared.streams.lock();
            if streams.contains_key(id) {
                return Err(TransportError::DuplicateRequest(id.clone()));
            }
            streams.insert(id.clone(), tx);
        }
        Ok(ReplyStream {
            id: id.clone(),
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Send `msg` and return a stream of every reply correlated to it.
    pub async fn request_stream(&self, msg: &Message) -> Result<ReplyStream, TransportError> {
        let stream = self.open_stream(&msg.id)?;
        self.send(msg).await?;
        Ok(stream)
    }

    /// Cancel the reader, wait for it, close the socket and clear the
    /// pending and stream tables. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut in_progress = false;
        self.shared.state.send_modify(|state| match state {
            ClientState::Closing => in_progress = true,
            ClientState::Closed => {}
            _ => *state = ClientState::Closing,
        });
        if in_progress {
            self.wait_closed().await;
            return;
        }

        self.cancel.cancel();
        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("reader task ended abnormally: {}", e);
            }
        }
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.shared.clear();
        self.shared.state.send_replace(ClientState::Closed);
        debug!("client for {:?} closed", self.path);
    }

    /// Resolve once the client reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ClientState::Closed).await;
    }

    pub fn has_reader_task(&self) -> bool {
        self.reader_task.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    conn: Connection,
    reader: MessageReader,
    cancel: CancellationToken,
) {
    let frames = reader.into_stream();
    tokio::pin!(frames);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(Frame::Message(msg))) => shared.dispatch(msg),
            Some(Ok(Frame::Malformed(err))) => {
                warn!(conn = %conn.id(), "skipping malformed message: {}", err)
            }
            Some(Err(e)) => {
                warn!(conn = %conn.id(), "read error: {}", e);
                break;
            }
            None => {
                debug!(conn = %conn.id(), "server closed connection");
                break;
            }
        }
    }

    // Peer is gone: fail every waiter instead of letting it run into its timeout.
    conn.close().await;
    shared.clear();
    let _ = shared.transition(
        "observe close",
        &[ClientState::Connecting, ClientState::Connected],
        ClientState::Closed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{MessageHandler, Server, ServerHandle};
    use async_trait::async_trait;
    use mist_protocol::MessageType;
    use serde_json::json;
    use tempfile::TempDir;

    /// Replies to `command`, streams three chunks for `stream`, ignores
    /// `silent`, pushes an uncorrelated message for `push`.
    struct TestHandler;

    #[async_trait]
    impl MessageHandler for TestHandler {
        async fn handle(&self, msg: Message, conn: &Connection) {
            let text = msg.payload["text"].as_str().unwrap_or_default().to_string();
            match text.as_str() {
                "silent" => {}
                "stream" => {
                    for i in 0..3 {
                        let chunk = Message::reply(
                            &msg,
                            "srv",
                            MessageType::StreamChunk,
                            json!({"text": i.to_string()}),
                        );
                        conn.send(&chunk).await.unwrap();
                    }
                    let end = Message::reply(&msg, "srv", MessageType::StreamEnd, json!({}));
                    conn.send(&end).await.unwrap();
                }
                "push" => {
                    let push =
                        Message::create(MessageType::AgentMessage, "srv", "t", json!({"n": 1}));
                    conn.send(&push).await.unwrap();
                }
                "hangup" => conn.close().await,
                _ => {
                    let reply = Message::reply(
                        &msg,
                        "srv",
                        MessageType::Response,
                        json!({"text": format!("echo: {}", text)}),
                    );
                    conn.send(&reply).await.unwrap();
                }
            }
        }
    }

    async fn start() -> (TempDir, ServerHandle, Client) {
        let tmp = TempDir::new().unwrap();
        let sock = tmp.path().join("test.sock");
        let handle = Server::bind(&sock, Arc::new(TestHandler)).await.unwrap().start();
        let client = Client::new(&sock);
        client.connect().await.unwrap();
        (tmp, handle, client)
    }

    fn command(text: &str) -> Message {
        Message::create(MessageType::Command, "test", "srv", json!({"text": text}))
    }

    #[tokio::test]
    async fn test_request_gets_correlated_reply() {
        let (_tmp, server, client) = start().await;
        assert_eq!(client.state(), ClientState::Connected);

        let msg = command("hello");
        let reply = client.request(msg.clone(), Duration::from_secs(2)).await.unwrap();
        assert!(reply.is_reply_to(&msg.id));
        assert_eq!(reply.payload["text"], "echo: hello");
        assert_eq!(client.pending_count(), 0);

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_cross() {
        let (_tmp, server, client) = start().await;
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let text = format!("m{}", i);
                let reply = client
                    .request(command(&text), Duration::from_secs(2))
                    .await
                    .unwrap();
                assert_eq!(reply.payload["text"], format!("echo: {}", text));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (_tmp, server, client) = start().await;
        let err = client
            .request(command("silent"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_count(), 0);

        // Still usable afterwards.
        client.request(command("x"), Duration::from_secs(2)).await.unwrap();

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (_tmp, server, client) = start().await;
        let client = Arc::new(client);
        let msg = command("silent");

        let first = {
            let client = client.clone();
            let msg = msg.clone();
            tokio::spawn(async move { client.request(msg, Duration::from_millis(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = client.request(msg, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::DuplicateRequest(_)));
        assert!(first.await.unwrap().unwrap_err().is_timeout());

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reply_stream_ends_on_stream_end() {
        let (_tmp, server, client) = start().await;
        let mut stream = client.request_stream(&command("stream")).await.unwrap();
        assert_eq!(client.stream_count(), 1);

        let mut chunks = Vec::new();
        while let Some(msg) = stream.next().await {
            if msg.msg_type == MessageType::StreamEnd {
                break;
            }
            chunks.push(msg.payload["text"].as_str().unwrap().to_string());
        }
        assert_eq!(chunks, ["0", "1", "2"]);
        assert!(stream.next().await.is_none());
        assert_eq!(client.stream_count(), 0);

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsolicited_messages_surface() {
        let (_tmp, server, client) = start().await;
        let mut events = client.subscribe_unsolicited();
        client.send(&command("push")).await.unwrap();

        let push = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(push.msg_type, MessageType::AgentMessage);

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_close_clears_tables_with_requests_in_flight() {
        let (_tmp, server, client) = start().await;
        let client = Arc::new(client);

        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(command("silent"), Duration::from_secs(10))
                    .await
            })
        };
        let _stream = client.request_stream(&command("silent")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.pending_count(), 1);
        assert_eq!(client.stream_count(), 1);

        client.close().await;

        assert!(!client.has_reader_task());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stream_count(), 0);
        assert_eq!(client.state(), ClientState::Closed);
        assert!(in_flight.await.unwrap().unwrap_err().is_closed());

        client.close().await;
        client.wait_closed().await;
        assert_eq!(client.state(), ClientState::Closed);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let (_tmp, server, client) = start().await;
        client.close().await;
        let err = client
            .request(command("x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(ClientState::Closed)));
        assert!(client.connect().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_connect_rejected() {
        let client = Client::new("/nonexistent/mist.sock");
        let err = client.send(&command("x")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(ClientState::Disconnected)));
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_hangup_fails_pending_and_closes() {
        let (_tmp, server, client) = start().await;
        let err = client
            .request(command("hangup"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_closed());
        client.wait_closed().await;
        assert_eq!(client.state(), ClientState::Closed);

        client.close().await;
        assert!(!client.has_reader_task());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_close_during_connect_leaves_no_reader() {
        let client = Client::new("/nonexistent/test.sock");
        client
            .shared
            .transition("connect", &[ClientState::Disconnected], ClientState::Connecting)
            .unwrap();
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);

        let (stream, _peer) = tokio::net::UnixStream::pair().unwrap();
        let (conn, reader) = Connection::from_stream(stream);
        let err = client.attach(conn, reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.has_reader_task());
        assert!(client.conn.lock().is_none());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stream_count(), 0);
    }
}
