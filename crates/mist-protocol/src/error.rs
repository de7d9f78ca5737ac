use thiserror::Error;

/// Failure to turn a wire line into a [`crate::Message`] (or back).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}
