//! Broker-resident services invoked through `service.request`.
//!
//! The set of services is closed: each one is a [`Service`] variant, and the
//! [`ServiceRegistry`] mapping names to services is built once at startup.

mod events;
mod llm;
mod ollama;
pub mod params;
mod tasks;

pub use events::{
    occurrences, Event, EventService, EventStore, EventUpdate, Frequency, MemoryEventStore,
    NewEvent, Occurrence, Recurrence,
};
pub use llm::{ChatBackend, ChatRequest, LlmService};
pub use ollama::OllamaBackend;
pub use tasks::{MemoryTaskStore, Task, TaskService, TaskStatus, TaskStore, TaskUpdate};

use async_trait::async_trait;
use mist_config::LlmConfig;
use mist_protocol::{Message, MessageType, ServiceRequest, BROKER_ID};
use mist_transport::{Connection, TransportError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ServiceError;

/// Common contract of every service.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, action: &str, params: Value) -> Result<Value, ServiceError>;

    /// Run the request carried by `msg` and send exactly one reply on `conn`:
    /// `service.response {result}` or `service.error {error}`.
    async fn handle(&self, msg: &Message, conn: &Connection) -> Result<(), TransportError> {
        let outcome = match msg.payload_as::<ServiceRequest>() {
            Ok(request) => {
                debug!(service = self.name(), action = %request.action, "service call");
                self.call(&request.action, request.params).await
            }
            Err(e) => Err(ServiceError::InvalidParams(e.to_string())),
        };
        conn.send(&service_reply(msg, outcome)).await
    }
}

/// Build the reply for a finished service call.
pub fn service_reply(request: &Message, outcome: Result<Value, ServiceError>) -> Message {
    match outcome {
        Ok(result) => Message::reply(
            request,
            BROKER_ID,
            MessageType::ServiceResponse,
            json!({ "result": result }),
        ),
        Err(err) => {
            warn!(id = %request.id, "service error: {}", err);
            Message::reply(
                request,
                BROKER_ID,
                MessageType::ServiceError,
                json!({ "error": err.to_string() }),
            )
        }
    }
}

pub enum Service {
    Llm(LlmService),
    Tasks(TaskService),
    Events(EventService),
}

#[async_trait]
impl ServiceHandler for Service {
    fn name(&self) -> &'static str {
        match self {
            Self::Llm(_) => LlmService::NAME,
            Self::Tasks(_) => TaskService::NAME,
            Self::Events(_) => EventService::NAME,
        }
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, ServiceError> {
        match self {
            Self::Llm(svc) => svc.call(action, params).await,
            Self::Tasks(svc) => svc.call(action, params).await,
            Self::Events(svc) => svc.call(action, params).await,
        }
    }
}

/// Name -> service table.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<&'static str, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `llm` over `backend`, `tasks` over `tasks` and `events` over `events`.
    pub fn builtin(
        llm: &LlmConfig,
        backend: Arc<dyn ChatBackend>,
        tasks: Arc<dyn TaskStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self::new()
            .with(Service::Llm(LlmService::new(backend, llm.max_concurrent)))
            .with(Service::Tasks(TaskService::new(tasks)))
            .with(Service::Events(EventService::new(events)))
    }

    /// Register `service`, replacing any service of the same name.
    pub fn with(mut self, service: Service) -> Self {
        self.services.insert(service.name(), service);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
