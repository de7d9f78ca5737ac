//! Unix socket transport for MIST messages.
//!
//! - [`Connection`] / [`MessageReader`]: one socket, newline-delimited JSON
//!   frames, atomic whole-frame writes.
//! - [`Server`]: accepts connections and feeds every decoded message to a
//!   [`MessageHandler`], one connection per task.
//! - [`Client`]: outbound connection with request/response correlation,
//!   reply streams and timeouts.

mod client;
mod connection;
mod error;
mod server;

pub use client::{Client, ClientState, ReplyStream};
pub use connection::{Connection, ConnectionId, Frame, MessageReader};
pub use error::TransportError;
pub use server::{remove_socket, MessageHandler, Server, ServerHandle};
