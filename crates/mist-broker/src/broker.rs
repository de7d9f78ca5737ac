//! Routing core: every message received on the broker socket is dispatched
//! here by type.

use async_trait::async_trait;
use futures::FutureExt;
use mist_config::MistConfig;
use mist_protocol::{
    AgentManifest, CatalogResponse, Message, MessageId, MessageType, RegisterAck, ServiceRequest,
    BROKER_ID,
};
use mist_transport::{Connection, MessageHandler, Server, TransportError};
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::error::ServiceError;
use crate::pending::{PendingCommand, PendingCommands};
use crate::services::{
    service_reply, MemoryEventStore, MemoryTaskStore, OllamaBackend, ServiceHandler,
    ServiceRegistry,
};

fn command_error(msg: &Message, error: impl Into<String>) -> Message {
    Message::reply(
        msg,
        BROKER_ID,
        MessageType::Response,
        json!({ "error": error.into() }),
    )
}

fn protocol_error(msg: &Message, error: impl Into<String>) -> Message {
    Message::reply(
        msg,
        BROKER_ID,
        MessageType::Error,
        json!({ "error": error.into() }),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn send_reply(conn: &Connection, reply: &Message) {
    if let Err(e) = conn.send(reply).await {
        debug!(conn = %conn.id(), msg_type = %reply.msg_type, "reply not delivered: {}", e);
    }
}

/// Owns the agent catalog, the forwarded-command table and the service
/// registry. Shared with the transport server as `Arc<Broker>`.
pub struct Broker {
    catalog: Catalog,
    pending: PendingCommands,
    services: ServiceRegistry,
}

impl Broker {
    pub fn new(services: ServiceRegistry) -> Self {
        Self {
            catalog: Catalog::new(),
            pending: PendingCommands::new(),
            services,
        }
    }

    /// Built-in services: `llm` backed by Ollama at `llm.endpoint`, with
    /// `tasks` and `events` backed by in-memory stores.
    pub fn from_config(config: &MistConfig) -> Self {
        let backend = Arc::new(OllamaBackend::from_config(&config.llm));
        Self::new(ServiceRegistry::builtin(
            &config.llm,
            backend,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryEventStore::new()),
        ))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Bind the broker socket at `path` with permissions `mode`.
    pub async fn bind(self: Arc<Self>, path: &Path, mode: u32) -> Result<Server<Self>, TransportError> {
        info!(services = ?self.services.names(), "binding broker");
        Server::bind_with_mode(path, self, mode).await
    }

    async fn reply_with<T: Serialize>(
        &self,
        msg: &Message,
        conn: &Connection,
        msg_type: MessageType,
        payload: &T,
    ) {
        match Message::reply_with(msg, BROKER_ID, msg_type, payload) {
            Ok(reply) => send_reply(conn, &reply).await,
            Err(e) => error!(id = %msg.id, "failed to encode reply: {}", e),
        }
    }

    async fn handle_register(&self, msg: &Message, conn: &Connection) {
        let manifest = match msg.payload_as::<AgentManifest>() {
            Ok(m) => m,
            Err(e) => {
                warn!(conn = %conn.id(), "invalid registration: {}", e);
                send_reply(conn, &protocol_error(msg, format!("invalid registration: {}", e)))
                    .await;
                return;
            }
        };

        let registration = self.catalog.register(manifest, conn);
        info!(
            agent_id = %registration.agent_id,
            conn = %conn.id(),
            commands = registration.commands.len(),
            "agent registered"
        );
        let ack = RegisterAck {
            agent_id: registration.agent_id,
        };
        self.reply_with(msg, conn, MessageType::RegisterAck, &ack).await;
    }

    async fn handle_catalog_request(&self, msg: &Message, conn: &Connection) {
        let catalog = CatalogResponse {
            agents: self.catalog.snapshot(),
        };
        debug!(agents = catalog.agents.len(), "catalog request");
        self.reply_with(msg, conn, MessageType::CatalogResponse, &catalog)
            .await;
    }

    /// Forward a `command` or `agent.message` to the agent named in `to`.
    async fn handle_forward(&self, msg: &Message, conn: &Connection) {
        let Some(agent_conn) = self.catalog.connection(&msg.to) else {
            warn!(agent_id = %msg.to, msg_type = %msg.msg_type, "unknown agent");
            send_reply(conn, &command_error(msg, format!("unknown agent: {}", msg.to))).await;
            return;
        };

        if !self.pending.insert(msg, conn.clone()) {
            warn!(id = %msg.id, agent_id = %msg.to, "duplicate command id");
            send_reply(conn, &command_error(msg, format!("duplicate command id: {}", msg.id)))
                .await;
            return;
        }
        debug!(id = %msg.id, agent_id = %msg.to, "forwarding {}", msg.msg_type);
        if let Err(e) = agent_conn.send(msg).await {
            warn!(agent_id = %msg.to, "forward failed, dropping agent: {}", e);
            self.drop_agent(&msg.to).await;
        }
    }

    /// Relay an agent's reply to whoever sent the command. `terminal`
    /// replies close the exchange.
    async fn handle_agent_reply(&self, msg: &Message, conn: &Connection, terminal: bool) {
        let Some(id) = &msg.correlates_to else {
            warn!(conn = %conn.id(), msg_type = %msg.msg_type, "uncorrelated reply dropped");
            return;
        };
        let Some(agent_id) = self.catalog.agent_for(conn) else {
            warn!(id = %id, conn = %conn.id(), "reply from a connection with no agent");
            return;
        };
        let entry = if terminal {
            self.pending.take(&agent_id, id)
        } else {
            self.pending.get(&agent_id, id)
        };
        let Some(entry) = entry else {
            debug!(id = %id, agent_id = %agent_id, "no pending command for reply");
            return;
        };
        if let Err(e) = entry.origin.send(msg).await {
            debug!(id = %id, "origin gone, reply dropped: {}", e);
        }
    }

    /// Fan an `agent.broadcast` out to every agent except the one that sent
    /// it. Nothing is tracked; broadcasts get no replies.
    async fn handle_broadcast(&self, msg: &Message, conn: &Connection) {
        let from = self.catalog.agent_for(conn);
        let mut delivered = 0usize;
        for (agent_id, agent_conn) in self.catalog.connections() {
            if from.as_deref() == Some(agent_id.as_str()) {
                continue;
            }
            match agent_conn.send(msg).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(agent_id = %agent_id, "broadcast failed, dropping agent: {}", e);
                    self.drop_agent(&agent_id).await;
                }
            }
        }
        debug!(id = %msg.id, delivered, "broadcast");
    }

    async fn handle_service_request(&self, msg: &Message, conn: &Connection) {
        let request = match msg.payload_as::<ServiceRequest>() {
            Ok(r) => r,
            Err(e) => {
                let err = ServiceError::InvalidParams(e.to_string());
                send_reply(conn, &service_reply(msg, Err(err))).await;
                return;
            }
        };
        let Some(service) = self.services.get(&request.service) else {
            let err = ServiceError::UnknownService(request.service);
            send_reply(conn, &service_reply(msg, Err(err))).await;
            return;
        };

        match AssertUnwindSafe(service.handle(msg, conn))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(id = %msg.id, "service reply not delivered: {}", e),
            Err(panic) => {
                let text = panic_message(&*panic);
                error!(service = %request.service, action = %request.action, "service panicked: {}", text);
                let err = ServiceError::Panicked(text);
                send_reply(conn, &service_reply(msg, Err(err))).await;
            }
        }
    }

    /// Unregister `agent_id` and fail every command still waiting on it.
    async fn drop_agent(&self, agent_id: &str) {
        if self.catalog.unregister(agent_id).is_some() {
            info!(agent_id = %agent_id, "agent unregistered");
        }
        self.fail_pending(agent_id).await;
    }

    /// Same as [`Broker::drop_agent`] for whatever agent registered on `conn`.
    async fn drop_conn_agent(&self, conn: &Connection) {
        if let Some(registration) = self.catalog.unregister_by_conn(conn) {
            info!(agent_id = %registration.agent_id, conn = %conn.id(), "agent unregistered");
            self.fail_pending(&registration.agent_id).await;
        }
    }

    async fn fail_pending(&self, agent_id: &str) {
        for (id, command) in self.pending.remove_for_target(agent_id) {
            self.fail_command(id, command).await;
        }
    }

    async fn fail_command(&self, id: MessageId, command: PendingCommand) {
        let reply = Message {
            correlates_to: Some(id),
            ..Message::create(
                MessageType::Response,
                BROKER_ID,
                command.sender,
                json!({ "error": format!("agent disconnected: {}", command.target) }),
            )
        };
        send_reply(&command.origin, &reply).await;
    }
}

#[async_trait]
impl MessageHandler for Broker {
    async fn handle(&self, msg: Message, conn: &Connection) {
        debug!(conn = %conn.id(), id = %msg.id, msg_type = %msg.msg_type, "received");
        match &msg.msg_type {
            MessageType::Register => self.handle_register(&msg, conn).await,
            MessageType::Disconnect => self.drop_conn_agent(conn).await,
            MessageType::CatalogRequest => self.handle_catalog_request(&msg, conn).await,
            MessageType::Command | MessageType::AgentMessage => {
                self.handle_forward(&msg, conn).await
            }
            MessageType::Broadcast => self.handle_broadcast(&msg, conn).await,
            MessageType::Response | MessageType::StreamEnd => {
                self.handle_agent_reply(&msg, conn, true).await
            }
            MessageType::StreamChunk => self.handle_agent_reply(&msg, conn, false).await,
            MessageType::Error if msg.correlates_to.is_some() => {
                self.handle_agent_reply(&msg, conn, true).await
            }
            MessageType::ServiceRequest => self.handle_service_request(&msg, conn).await,
            MessageType::Unknown(t) => {
                warn!(conn = %conn.id(), "unknown message type: {}", t);
                send_reply(conn, &protocol_error(&msg, format!("unknown message type: {}", t)))
                    .await;
            }
            other => {
                warn!(conn = %conn.id(), "unexpected message type: {}", other);
                send_reply(conn, &protocol_error(&msg, format!("unexpected message type: {}", other)))
                    .await;
            }
        }
    }

    async fn on_disconnect(&self, conn: &Connection) {
        self.drop_conn_agent(conn).await;
        let dropped = self.pending.remove_for_origin(conn);
        if dropped > 0 {
            debug!(conn = %conn.id(), dropped, "dropped commands from closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ChatBackend, ChatRequest};
    use mist_config::LlmConfig;
    use mist_protocol::{CommandReply, ManifestBuilder};
    use mist_transport::{Frame, MessageReader};
    use std::time::Duration;
    use tokio::net::UnixStream;

    struct PanickingBackend;

    #[async_trait]
    impl ChatBackend for PanickingBackend {
        async fn chat(&self, _request: ChatRequest) -> anyhow::Result<String> {
            panic!("backend exploded");
        }
    }

    fn broker() -> Broker {
        Broker::new(ServiceRegistry::builtin(
            &LlmConfig::default(),
            Arc::new(PanickingBackend),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryEventStore::new()),
        ))
    }

    /// Broker-side connection plus the reader on the peer's end.
    struct Peer {
        conn: Connection,
        reader: MessageReader,
        _write: Connection,
    }

    impl Peer {
        fn new() -> Self {
            let (a, b) = UnixStream::pair().unwrap();
            let (conn, _) = Connection::from_stream(a);
            let (write, reader) = Connection::from_stream(b);
            Self {
                conn,
                reader,
                _write: write,
            }
        }

        async fn recv(&mut self) -> Message {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.reader.next_frame())
                .await
                .unwrap()
                .unwrap();
            match frame {
                Some(Frame::Message(m)) => m,
                other => panic!("expected message, got {:?}", other),
            }
        }
    }

    async fn register(broker: &Broker, peer: &mut Peer, name: &str) -> String {
        let manifest = ManifestBuilder::new(name).command("echo", "Echo").build();
        let msg = Message::create(
            MessageType::Register,
            name,
            BROKER_ID,
            serde_json::to_value(manifest).unwrap(),
        );
        broker.handle(msg.clone(), &peer.conn).await;
        let ack = peer.recv().await;
        assert_eq!(ack.msg_type, MessageType::RegisterAck);
        assert!(ack.is_reply_to(&msg.id));
        ack.payload_as::<RegisterAck>().unwrap().agent_id
    }

    #[tokio::test]
    async fn test_register_is_acknowledged_and_listed() {
        let broker = broker();
        let mut agent = Peer::new();
        let mut ui = Peer::new();

        assert_eq!(register(&broker, &mut agent, "echo").await, "echo-0");

        let req = Message::create(MessageType::CatalogRequest, "ui", BROKER_ID, json!({}));
        broker.handle(req.clone(), &ui.conn).await;
        let reply = ui.recv().await;
        assert_eq!(reply.msg_type, MessageType::CatalogResponse);
        assert!(reply.is_reply_to(&req.id));
        let catalog: CatalogResponse = reply.payload_as().unwrap();
        assert_eq!(catalog.agents.len(), 1);
        assert_eq!(catalog.agents[0].name, "echo");
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let broker = broker();
        let mut agent = Peer::new();
        let msg = Message::create(MessageType::Register, "x", BROKER_ID, json!({"commands": 3}));
        broker.handle(msg, &agent.conn).await;
        let reply = agent.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert!(broker.catalog().is_empty());
    }

    #[tokio::test]
    async fn test_command_forwarded_and_reply_relayed() {
        let broker = broker();
        let mut agent = Peer::new();
        let mut ui = Peer::new();
        let agent_id = register(&broker, &mut agent, "echo").await;

        let cmd = Message::create(MessageType::Command, "ui", &agent_id, json!({"text": "hi"}));
        broker.handle(cmd.clone(), &ui.conn).await;
        let forwarded = agent.recv().await;
        assert_eq!(forwarded, cmd);
        assert_eq!(broker.pending().len(), 1);

        let chunk = Message::reply(&cmd, &agent_id, MessageType::StreamChunk, json!({"text": "h"}));
        broker.handle(chunk.clone(), &agent.conn).await;
        assert_eq!(ui.recv().await, chunk);
        assert_eq!(broker.pending().len(), 1);

        let response = Message::reply(&cmd, &agent_id, MessageType::Response, json!({"text": "echo: hi"}));
        broker.handle(response.clone(), &agent.conn).await;
        assert_eq!(ui.recv().await, response);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_reply_from_wrong_connection_ignored() {
        let broker = broker();
        let mut agent = Peer::new();
        let ui = Peer::new();
        let agent_id = register(&broker, &mut agent, "echo").await;

        let cmd = Message::create(MessageType::Command, "ui", &agent_id, json!({"text": "hi"}));
        broker.handle(cmd.clone(), &ui.conn).await;
        agent.recv().await;

        let forged = Message::reply(&cmd, "ui", MessageType::Response, json!({"text": "fake"}));
        broker.handle(forged, &ui.conn).await;
        assert_eq!(broker.pending().len(), 1);
    }

    fn command_with_id(id: &str, sender: &str, to: &str, text: &str) -> Message {
        Message {
            id: MessageId::from(id),
            ..Message::create(MessageType::Command, sender, to, json!({ "text": text }))
        }
    }

    #[tokio::test]
    async fn test_same_id_from_two_callers_does_not_cross() {
        let broker = broker();
        let mut agent = Peer::new();
        let mut ui_a = Peer::new();
        let mut ui_b = Peer::new();
        let agent_id = register(&broker, &mut agent, "echo").await;

        let from_a = command_with_id("1", "ui-a", &agent_id, "from a");
        broker.handle(from_a.clone(), &ui_a.conn).await;
        assert_eq!(agent.recv().await, from_a);

        let from_b = command_with_id("1", "ui-b", &agent_id, "from b");
        broker.handle(from_b, &ui_b.conn).await;
        let rejected = ui_b.recv().await;
        assert_eq!(rejected.msg_type, MessageType::Response);
        assert_eq!(rejected.payload["error"], "duplicate command id: 1");
        assert_eq!(broker.pending().len(), 1);

        let reply = Message::reply(&from_a, &agent_id, MessageType::Response, json!({"text": "echo: from a"}));
        broker.handle(reply.clone(), &agent.conn).await;
        assert_eq!(ui_a.recv().await, reply);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_same_id_to_different_agents_routes_each_reply() {
        let broker = broker();
        let mut echo = Peer::new();
        let mut notes = Peer::new();
        let mut ui_a = Peer::new();
        let mut ui_b = Peer::new();
        let echo_id = register(&broker, &mut echo, "echo").await;
        let notes_id = register(&broker, &mut notes, "notes").await;

        let to_echo = command_with_id("1", "ui-a", &echo_id, "a");
        let to_notes = command_with_id("1", "ui-b", &notes_id, "b");
        broker.handle(to_echo.clone(), &ui_a.conn).await;
        broker.handle(to_notes.clone(), &ui_b.conn).await;
        echo.recv().await;
        notes.recv().await;
        assert_eq!(broker.pending().len(), 2);

        let notes_reply = Message::reply(&to_notes, &notes_id, MessageType::Response, json!({"text": "b"}));
        broker.handle(notes_reply.clone(), &notes.conn).await;
        assert_eq!(ui_b.recv().await, notes_reply);

        let echo_reply = Message::reply(&to_echo, &echo_id, MessageType::Response, json!({"text": "a"}));
        broker.handle(echo_reply.clone(), &echo.conn).await;
        assert_eq!(ui_a.recv().await, echo_reply);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let broker = broker();
        let mut echo = Peer::new();
        let mut notes = Peer::new();
        let mut todo = Peer::new();
        let echo_id = register(&broker, &mut echo, "echo").await;
        register(&broker, &mut notes, "notes").await;
        register(&broker, &mut todo, "todo").await;

        let from_echo = Message::create(MessageType::Broadcast, &echo_id, "*", json!({"event": "saved"}));
        broker.handle(from_echo.clone(), &echo.conn).await;
        assert_eq!(notes.recv().await, from_echo);
        assert_eq!(todo.recv().await, from_echo);

        // A UI is not an agent, so every agent hears it, echo included.
        let ui = Peer::new();
        let from_ui = Message::create(MessageType::Broadcast, "ui", "*", json!({"event": "theme"}));
        broker.handle(from_ui.clone(), &ui.conn).await;
        assert_eq!(echo.recv().await, from_ui);
        assert_eq!(notes.recv().await, from_ui);
        assert_eq!(todo.recv().await, from_ui);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_drops_agent_that_cannot_be_reached() {
        let broker = broker();
        let mut echo = Peer::new();
        let mut notes = Peer::new();
        register(&broker, &mut echo, "echo").await;
        let notes_id = register(&broker, &mut notes, "notes").await;
        notes.conn.close().await;

        let ui = Peer::new();
        let msg = Message::create(MessageType::Broadcast, "ui", "*", json!({}));
        broker.handle(msg.clone(), &ui.conn).await;
        assert_eq!(echo.recv().await, msg);
        assert_eq!(broker.catalog().len(), 1);
        assert!(broker.catalog().connection(&notes_id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent_gets_error_response() {
        let broker = broker();
        let mut ui = Peer::new();
        let cmd = Message::create(MessageType::Command, "ui", "ghost", json!({"text": "hi"}));
        broker.handle(cmd.clone(), &ui.conn).await;

        let reply = ui.recv().await;
        assert_eq!(reply.msg_type, MessageType::Response);
        assert!(reply.is_reply_to(&cmd.id));
        let reply: CommandReply = reply.payload_as().unwrap();
        assert_eq!(reply.error.as_deref(), Some("unknown agent: ghost"));
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_agent_disconnect_fails_pending_commands() {
        let broker = broker();
        let mut agent = Peer::new();
        let mut ui = Peer::new();
        let agent_id = register(&broker, &mut agent, "echo").await;

        let cmd = Message::create(MessageType::Command, "ui", &agent_id, json!({"text": "hi"}));
        broker.handle(cmd.clone(), &ui.conn).await;
        agent.recv().await;

        broker.on_disconnect(&agent.conn).await;
        assert!(broker.catalog().is_empty());
        assert!(broker.pending().is_empty());

        let reply = ui.recv().await;
        assert!(reply.is_reply_to(&cmd.id));
        assert_eq!(reply.to, "ui");
        assert_eq!(reply.payload["error"], format!("agent disconnected: {}", agent_id));

        let again = Message::create(MessageType::Command, "ui", &agent_id, json!({"text": "hi"}));
        broker.handle(again, &ui.conn).await;
        let reply = ui.recv().await;
        assert_eq!(reply.payload["error"], format!("unknown agent: {}", agent_id));
    }

    #[tokio::test]
    async fn test_graceful_unregister() {
        let broker = broker();
        let mut agent = Peer::new();
        register(&broker, &mut agent, "echo").await;

        let bye = Message::create(MessageType::Disconnect, "echo", BROKER_ID, json!({}));
        broker.handle(bye, &agent.conn).await;
        assert!(broker.catalog().is_empty());
    }

    #[tokio::test]
    async fn test_origin_disconnect_drops_its_commands() {
        let broker = broker();
        let mut agent = Peer::new();
        let ui = Peer::new();
        let agent_id = register(&broker, &mut agent, "echo").await;

        let cmd = Message::create(MessageType::Command, "ui", &agent_id, json!({"text": "hi"}));
        broker.handle(cmd, &ui.conn).await;
        broker.on_disconnect(&ui.conn).await;
        assert!(broker.pending().is_empty());
        assert_eq!(broker.catalog().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let broker = broker();
        let mut ui = Peer::new();
        let req = Message::create(
            MessageType::ServiceRequest,
            "ui",
            BROKER_ID,
            json!({"service": "weather", "action": "get", "params": {}}),
        );
        broker.handle(req.clone(), &ui.conn).await;
        let reply = ui.recv().await;
        assert_eq!(reply.msg_type, MessageType::ServiceError);
        assert!(reply.is_reply_to(&req.id));
        assert_eq!(reply.payload["error"], "unknown service: weather");
    }

    #[tokio::test]
    async fn test_service_panic_becomes_service_error() {
        let broker = broker();
        let mut ui = Peer::new();
        let req = Message::create(
            MessageType::ServiceRequest,
            "ui",
            BROKER_ID,
            json!({"service": "llm", "action": "chat", "params": {"prompt": "hi"}}),
        );
        broker.handle(req.clone(), &ui.conn).await;
        let reply = ui.recv().await;
        assert_eq!(reply.msg_type, MessageType::ServiceError);
        assert!(reply.is_reply_to(&req.id));
        assert!(reply.payload["error"]
            .as_str()
            .unwrap()
            .contains("backend exploded"));

        // Broker keeps serving.
        let list = Message::create(
            MessageType::ServiceRequest,
            "ui",
            BROKER_ID,
            json!({"service": "tasks", "action": "list"}),
        );
        broker.handle(list, &ui.conn).await;
        assert_eq!(ui.recv().await.msg_type, MessageType::ServiceResponse);
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let broker = broker();
        let mut ui = Peer::new();
        let msg = Message::create(
            MessageType::Unknown("note.save".into()),
            "ui",
            BROKER_ID,
            json!({}),
        );
        broker.handle(msg.clone(), &ui.conn).await;
        let reply = ui.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.payload["error"], "unknown message type: note.save");
    }
}
