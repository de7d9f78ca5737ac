//! MIST broker.
//!
//! Agents register over the broker socket and are recorded in the
//! [`Catalog`]; UI clients query the catalog, send commands that the broker
//! forwards to agents, and call broker-resident services (`llm`, `tasks`)
//! resolved through the [`ServiceRegistry`].

mod broker;
mod catalog;
mod error;
pub mod lifecycle;
mod pending;
pub mod services;

pub use broker::Broker;
pub use catalog::Catalog;
pub use error::ServiceError;
pub use pending::{PendingCommand, PendingCommands};
pub use services::{Service, ServiceHandler, ServiceRegistry};
