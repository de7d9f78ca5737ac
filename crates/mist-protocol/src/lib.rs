//! Wire protocol shared by the MIST broker, its agents and UI clients.
//!
//! Every unit of communication is a [`Message`] envelope serialized as one
//! JSON object per line. The `type` field decides how `payload` is read;
//! typed views over the payloads live in [`payload`] and [`manifest`].

mod error;
pub mod manifest;
mod message;
pub mod payload;

pub use error::ProtocolError;
pub use manifest::{AgentManifest, AgentRegistration, CommandSpec, ManifestBuilder, WidgetSpec};
pub use message::{Message, MessageId, MessageType, BROKER_ID};
pub use payload::{
    CatalogResponse, CommandPayload, CommandReply, ErrorPayload, RegisterAck, ServiceRequest,
    ServiceResponse, StreamChunk,
};
