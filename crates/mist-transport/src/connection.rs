//! One established socket pipe: a framed writer and a framed reader.

use futures::Stream;
use mist_protocol::{Message, ProtocolError};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::TransportError;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection.
///
/// Cheap to clone; clones share the socket. Each [`Connection::send`] writes
/// one whole frame while holding the writer lock, so frames from concurrent
/// senders never interleave.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Split a stream into its write handle and frame reader.
    pub fn from_stream(stream: UnixStream) -> (Self, MessageReader) {
        let id = ConnectionId::new();
        let (read, write) = stream.into_split();
        let conn = Self {
            id,
            writer: Arc::new(Mutex::new(write)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (conn, MessageReader::new(id, read))
    }

    pub async fn connect(path: &Path) -> Result<(Self, MessageReader), TransportError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let line = msg.to_json_line()?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::from_io)?;
        writer.flush().await.map_err(TransportError::from_io)?;
        trace!(conn = %self.id, msg_type = %msg.msg_type, id = %msg.id, "sent");
        Ok(())
    }

    /// Shut down the write half. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One decoded line off the wire.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// A line that did not decode. The stream stays usable.
    Malformed(ProtocolError),
}

/// Read side of a connection: reassembles newline-delimited frames.
pub struct MessageReader {
    conn: ConnectionId,
    reader: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl MessageReader {
    fn new(conn: ConnectionId, read: OwnedReadHalf) -> Self {
        Self {
            conn,
            reader: BufReader::new(read),
            buf: Vec::with_capacity(1024),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// Next frame, or `None` once the peer has closed. Blank lines are skipped.
    ///
    /// Cancel safe only between frames: dropping the future mid-line loses
    /// the partial line.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(TransportError::from_io)
                .or_else(|e| match e {
                    TransportError::Closed => Ok(0),
                    other => Err(other),
                })?;
            if n == 0 {
                return Ok(None);
            }

            let mut line = self.buf.as_slice();
            while let [rest @ .., b'\n' | b'\r'] = line {
                line = rest;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(match Message::decode_bytes(line) {
                Ok(msg) => Frame::Message(msg),
                Err(err) => Frame::Malformed(err),
            }));
        }
    }

    /// Lazy stream of frames, ending at EOF or after the first I/O error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Frame, TransportError>> + Send {
        async_stream::stream! {
            loop {
                match self.next_frame().await {
                    Ok(Some(frame)) => yield Ok(frame),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mist_protocol::MessageType;
    use serde_json::json;

    fn pair() -> ((Connection, MessageReader), (Connection, MessageReader)) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::from_stream(a), Connection::from_stream(b))
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let ((left, _), (_, mut right_rx)) = pair();
        let msg = Message::create(MessageType::Command, "a", "b", json!({"text": "hi\nthere"}));
        left.send(&msg).await.unwrap();

        match right_rx.next_frame().await.unwrap() {
            Some(Frame::Message(got)) => assert_eq!(got, msg),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_writes_are_reassembled() {
        let (mut raw, peer) = UnixStream::pair().unwrap();
        let (_conn, mut reader) = Connection::from_stream(peer);
        let msg = Message::create(MessageType::CatalogRequest, "ui", "broker", json!({}));
        let line = msg.to_json_line().unwrap();
        let (head, tail) = line.split_at(line.len() / 2);
        let (head, tail) = (head.to_string(), tail.to_string());

        let writer = tokio::spawn(async move {
            raw.write_all(head.as_bytes()).await.unwrap();
            raw.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            raw.write_all(tail.as_bytes()).await.unwrap();
            raw
        });

        match reader.next_frame().await.unwrap() {
            Some(Frame::Message(got)) => assert_eq!(got, msg),
            other => panic!("unexpected frame: {:?}", other),
        }
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_line_then_valid() {
        let (mut raw, peer) = UnixStream::pair().unwrap();
        let (_conn, mut reader) = Connection::from_stream(peer);
        let msg = Message::create(MessageType::Command, "a", "b", json!({}));
        let mut input = b"{not json}\n\n\xff\xfe\n".to_vec();
        input.extend_from_slice(msg.to_json_line().unwrap().as_bytes());
        raw.write_all(&input).await.unwrap();
        drop(raw);

        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Malformed(ProtocolError::Decode(_)))
        ));
        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Malformed(ProtocolError::InvalidUtf8))
        ));
        assert!(matches!(reader.next_frame().await.unwrap(), Some(Frame::Message(_))));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let ((left, _), (_, right_rx)) = pair();
        let big = "x".repeat(64 * 1024);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let conn = left.clone();
            let text = format!("{}{}", i, big);
            tasks.push(tokio::spawn(async move {
                let msg = Message::create(MessageType::Command, "a", "b", json!({"text": text}));
                conn.send(&msg).await.unwrap();
            }));
        }

        let collect = tokio::spawn(async move {
            right_rx
                .into_stream()
                .take(8)
                .collect::<Vec<_>>()
                .await
        });
        for t in tasks {
            t.await.unwrap();
        }
        let frames = collect.await.unwrap();
        assert_eq!(frames.len(), 8);
        for frame in frames {
            assert!(matches!(frame, Ok(Frame::Message(_))));
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let ((left, _), (_, mut right_rx)) = pair();
        left.close().await;
        left.close().await;
        assert!(left.is_closed());

        let msg = Message::create(MessageType::Command, "a", "b", json!({}));
        assert!(matches!(left.send(&msg).await, Err(TransportError::Closed)));
        assert!(right_rx.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_on_peer_close() {
        let ((left, left_rx), (_, right_rx)) = pair();
        drop(left);
        drop(left_rx);
        let frames: Vec<_> = right_rx.into_stream().collect().await;
        assert!(frames.is_empty());
    }
}
