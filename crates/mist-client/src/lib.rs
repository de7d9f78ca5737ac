//! Client library for the MIST broker.
//!
//! - [`BrokerClient`]: what UIs use to list agents, send commands and call
//!   broker services.
//! - [`AgentRunner`]: connects an [`Agent`] to the broker, registers its
//!   manifest and serves the commands routed to it.

mod agent;
mod broker_client;
mod error;

pub use agent::{Agent, AgentRunner, EchoAgent, Responder, RunningAgent};
pub use broker_client::{BrokerClient, ChatOptions, CommandStream, TaskInfo, DEFAULT_SENDER};
pub use error::ClientError;
