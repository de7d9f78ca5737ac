use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

use crate::error::ProtocolError;

/// Sender id the broker stamps on every message it originates.
pub const BROKER_ID: &str = "broker";

/// Unique message identifier.
///
/// Random 128-bit tokens rendered as 32 hex characters, so ids never
/// collide within a process lifetime regardless of which connection
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Message kind. Decides how the payload is interpreted.
///
/// Type strings this build does not know decode to [`MessageType::Unknown`]
/// with the original string preserved, so the broker can report them
/// instead of dropping the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Command,
    Response,
    Register,
    RegisterAck,
    Disconnect,
    CatalogRequest,
    CatalogResponse,
    AgentMessage,
    Broadcast,
    ServiceRequest,
    ServiceResponse,
    ServiceError,
    StreamChunk,
    StreamEnd,
    Error,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Register => "agent.register",
            Self::RegisterAck => "agent.ready",
            Self::Disconnect => "agent.disconnect",
            Self::CatalogRequest => "agent.list",
            Self::CatalogResponse => "agent.catalog",
            Self::AgentMessage => "agent.message",
            Self::Broadcast => "agent.broadcast",
            Self::ServiceRequest => "service.request",
            Self::ServiceResponse => "service.response",
            Self::ServiceError => "service.error",
            Self::StreamChunk => "stream.chunk",
            Self::StreamEnd => "stream.end",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }

    /// Replies that finish a request/response exchange.
    pub fn is_terminal_reply(&self) -> bool {
        matches!(
            self,
            Self::Response
                | Self::RegisterAck
                | Self::CatalogResponse
                | Self::ServiceResponse
                | Self::ServiceError
                | Self::StreamEnd
                | Self::Error
        )
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "command" => Self::Command,
            "response" => Self::Response,
            "agent.register" => Self::Register,
            "agent.ready" => Self::RegisterAck,
            "agent.disconnect" => Self::Disconnect,
            "agent.list" => Self::CatalogRequest,
            "agent.catalog" => Self::CatalogResponse,
            "agent.message" => Self::AgentMessage,
            "agent.broadcast" => Self::Broadcast,
            "service.request" => Self::ServiceRequest,
            "service.response" => Self::ServiceResponse,
            "service.error" => Self::ServiceError,
            "stream.chunk" | "response.chunk" => Self::StreamChunk,
            "stream.end" | "response.end" => Self::StreamEnd,
            "error" => Self::Error,
            _ => Self::Unknown(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable message envelope: the unit of communication on the wire.
///
/// Serialized as a single JSON object per line with the fields
/// `id, type, sender, to, payload` and optionally `correlates_to` and
/// `timestamp`. Payload strings may contain newlines; JSON escapes them,
/// so the frame delimiter never appears inside an encoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender: String,
    pub to: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlates_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Build a new message with a fresh id and no correlation.
    pub fn create(
        msg_type: MessageType,
        sender: impl Into<String>,
        to: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            msg_type,
            sender: sender.into(),
            to: to.into(),
            payload,
            correlates_to: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Build a reply addressed to `original`'s sender and correlated to its id.
    pub fn reply(
        original: &Message,
        sender: impl Into<String>,
        msg_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            correlates_to: Some(original.id.clone()),
            ..Self::create(msg_type, sender, original.sender.clone(), payload)
        }
    }

    /// Same as [`Message::reply`] but with a typed payload.
    pub fn reply_with<T: Serialize>(
        original: &Message,
        sender: impl Into<String>,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
        Ok(Self::reply(original, sender, msg_type, payload))
    }

    pub fn is_reply_to(&self, id: &MessageId) -> bool {
        self.correlates_to.as_ref() == Some(id)
    }

    /// Interpret the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| {
            ProtocolError::InvalidPayload {
                msg_type: self.msg_type.to_string(),
                source,
            }
        })
    }

    /// Serialize to one JSON line without the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Serialize to one newline-terminated frame.
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = self.encode()?;
        json.push('\n');
        Ok(json)
    }

    /// Parse one frame. A trailing `\n` or `\r\n` is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        serde_json::from_str(line).map_err(ProtocolError::Decode)
    }

    /// Parse one raw frame as read off the socket.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode(line)
    }
}
