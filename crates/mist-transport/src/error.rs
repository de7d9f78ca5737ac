use mist_protocol::{MessageId, ProtocolError};
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientState;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer hung up or the connection was closed locally.
    #[error("connection closed")]
    Closed,

    #[error("client is {0}, not connected")]
    NotConnected(ClientState),

    #[error("cannot {operation} while client is {state}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },

    #[error("request id already pending: {0}")]
    DuplicateRequest(MessageId),

    #[error("request {id} timed out after {after:?}")]
    Timeout { id: MessageId, after: Duration },
}

impl TransportError {
    /// Map write/read failures that mean "peer is gone" onto [`TransportError::Closed`].
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
