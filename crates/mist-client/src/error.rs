use mist_protocol::ProtocolError;
use mist_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No reply within the deadline. Distinct from [`ClientError::Service`].
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    /// `service.error` text, verbatim.
    #[error("{0}")]
    Service(String),

    /// Error reply to a command, verbatim.
    #[error("{0}")]
    Command(String),

    #[error("unexpected reply type: {0}")]
    UnexpectedReply(String),

    #[error("command already answered")]
    AlreadyAnswered,
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { after, .. } => Self::Timeout(after),
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
