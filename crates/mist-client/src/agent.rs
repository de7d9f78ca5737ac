//! Agent side of the broker protocol.
//!
//! An [`Agent`] declares a manifest and answers commands. [`AgentRunner`]
//! connects it to the broker, registers it, and invokes
//! [`Agent::handle_command`] on its own task for every `command` or
//! `agent.message` the broker forwards. A panicking handler is answered
//! with an error reply like any other failure.

use async_trait::async_trait;
use futures::FutureExt;
use mist_protocol::{
    AgentManifest, CommandPayload, CommandReply, ManifestBuilder, Message, MessageType,
    RegisterAck, StreamChunk, BROKER_ID,
};
use mist_transport::Client;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn manifest(&self) -> AgentManifest;

    /// Answer one command through `responder`. An `Err` return, or returning
    /// without answering, sends an error reply on the agent's behalf.
    async fn handle_command(
        &self,
        command: CommandPayload,
        responder: Responder,
    ) -> anyhow::Result<()>;

    /// An `agent.broadcast` from another agent or a UI. No reply is expected.
    async fn on_broadcast(&self, _msg: Message) {}
}

/// Reply channel for one forwarded command.
///
/// `chunk` may be called any number of times; `text`, `error` and `end`
/// finish the exchange and can be used once.
#[derive(Clone)]
pub struct Responder {
    client: Arc<Client>,
    request: Arc<Message>,
    agent_id: Arc<str>,
    finished: Arc<AtomicBool>,
}

impl Responder {
    /// The forwarded message.
    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn send<T: Serialize>(&self, msg_type: MessageType, payload: &T) -> Result<(), ClientError> {
        let reply = Message::reply_with(&self.request, &*self.agent_id, msg_type, payload)?;
        self.client.send(&reply).await?;
        Ok(())
    }

    fn finish(&self) -> Result<(), ClientError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyAnswered);
        }
        Ok(())
    }

    pub async fn chunk(&self, text: impl Into<String>) -> Result<(), ClientError> {
        if self.is_finished() {
            return Err(ClientError::AlreadyAnswered);
        }
        let chunk = StreamChunk { text: text.into() };
        self.send(MessageType::StreamChunk, &chunk).await
    }

    pub async fn end(&self) -> Result<(), ClientError> {
        self.finish()?;
        self.send(MessageType::StreamEnd, &json!({})).await
    }

    pub async fn text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.finish()?;
        self.send(MessageType::Response, &CommandReply::text(text)).await
    }

    pub async fn error(&self, error: impl Into<String>) -> Result<(), ClientError> {
        self.finish()?;
        self.send(MessageType::Response, &CommandReply::error(error))
            .await
    }
}

/// Connects an [`Agent`] to the broker.
pub struct AgentRunner<A> {
    agent: Arc<A>,
    socket: PathBuf,
    timeout: Duration,
}

impl<A: Agent> AgentRunner<A> {
    pub fn new(agent: A, socket: impl Into<PathBuf>) -> Self {
        Self {
            agent: Arc::new(agent),
            socket: socket.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Deadline for the registration acknowledgement.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect, register and start serving commands in the background.
    pub async fn start(self) -> Result<RunningAgent, ClientError> {
        let client = Arc::new(Client::new(&self.socket));
        let inbox = client.subscribe_unsolicited();
        client.connect().await?;

        let manifest = self.agent.manifest();
        let name = manifest.name.clone();
        let payload = serde_json::to_value(&manifest).map_err(mist_protocol::ProtocolError::Encode)?;
        let register = Message::create(MessageType::Register, &name, BROKER_ID, payload);

        let reply = match client.request(register, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                client.close().await;
                return Err(e.into());
            }
        };
        let agent_id = match reply.msg_type {
            MessageType::RegisterAck => reply.payload_as::<RegisterAck>()?.agent_id,
            other => {
                client.close().await;
                let detail = reply
                    .payload
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(|e| format!("{}: {}", other, e))
                    .unwrap_or_else(|| other.to_string());
                return Err(ClientError::UnexpectedReply(detail));
            }
        };
        info!(agent_id = %agent_id, "agent registered");

        let task = tokio::spawn(serve_commands(
            self.agent,
            client.clone(),
            Arc::from(agent_id.as_str()),
            inbox,
        ));
        Ok(RunningAgent {
            agent_id,
            client,
            task,
        })
    }

    /// [`AgentRunner::start`], then serve until the broker connection ends.
    pub async fn run(self) -> Result<(), ClientError> {
        let running = self.start().await?;
        running.wait_closed().await;
        Ok(())
    }
}

/// A registered agent serving commands.
pub struct RunningAgent {
    agent_id: String,
    client: Arc<Client>,
    task: JoinHandle<()>,
}

impl RunningAgent {
    /// The id the broker assigned.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Resolve once the broker connection is gone.
    pub async fn wait_closed(&self) {
        self.client.wait_closed().await;
    }

    /// Send `payload` as an `agent.broadcast` to every other agent.
    pub async fn broadcast(&self, payload: serde_json::Value) -> Result<(), ClientError> {
        let msg = Message::create(MessageType::Broadcast, &self.agent_id, BROKER_ID, payload);
        self.client.send(&msg).await?;
        Ok(())
    }

    /// Unregister, then close the connection.
    pub async fn stop(self) {
        let bye = Message::create(MessageType::Disconnect, &self.agent_id, BROKER_ID, json!({}));
        if let Err(e) = self.client.send(&bye).await {
            debug!(agent_id = %self.agent_id, "unregister not sent: {}", e);
        }
        self.client.close().await;
        if let Err(e) = self.task.await {
            warn!(agent_id = %self.agent_id, "command loop ended abnormally: {}", e);
        }
    }
}

async fn serve_commands<A: Agent>(
    agent: Arc<A>,
    client: Arc<Client>,
    agent_id: Arc<str>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
) {
    let closed = client.wait_closed();
    tokio::pin!(closed);

    loop {
        let msg = tokio::select! {
            _ = &mut closed => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg.msg_type {
            MessageType::Command | MessageType::AgentMessage => {
                tokio::spawn(dispatch(agent.clone(), client.clone(), agent_id.clone(), msg));
            }
            MessageType::Broadcast => {
                let agent = agent.clone();
                tokio::spawn(async move { agent.on_broadcast(msg).await });
            }
            other => debug!(agent_id = %agent_id, msg_type = %other, "ignoring message"),
        }
    }
    debug!(agent_id = %agent_id, "command loop finished");
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

async fn dispatch<A: Agent>(agent: Arc<A>, client: Arc<Client>, agent_id: Arc<str>, msg: Message) {
    let responder = Responder {
        client,
        request: Arc::new(msg),
        agent_id,
        finished: Arc::new(AtomicBool::new(false)),
    };

    let outcome = match responder.request().payload_as::<CommandPayload>() {
        Ok(command) => {
            match AssertUnwindSafe(agent.handle_command(command, responder.clone()))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let text = panic_message(&*panic);
                    warn!(agent_id = %responder.agent_id, "command handler panicked: {}", text);
                    Err(anyhow::anyhow!("agent panicked: {}", text))
                }
            }
        }
        Err(e) => Err(anyhow::anyhow!("invalid command: {}", e)),
    };

    if responder.is_finished() {
        if let Err(e) = outcome {
            warn!(agent_id = %responder.agent_id, "command failed after reply: {:#}", e);
        }
        return;
    }
    let error = match outcome {
        Ok(()) => "agent sent no reply".to_string(),
        Err(e) => format!("{:#}", e),
    };
    if let Err(e) = responder.error(error).await {
        debug!(agent_id = %responder.agent_id, "error reply not sent: {}", e);
    }
}

/// Demo agent: answers `<text>` with `echo: <text>`. The `stream` command
/// sends each following word as its own chunk.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn manifest(&self) -> AgentManifest {
        ManifestBuilder::new("echo")
            .description("Echoes text back")
            .command("echo", "Reply with the given text")
            .command("stream", "Reply word by word")
            .widget("chat", "chat", true)
            .build()
    }

    async fn handle_command(
        &self,
        command: CommandPayload,
        responder: Responder,
    ) -> anyhow::Result<()> {
        if command.command_name() == Some("stream") {
            // Without an explicit `command`, the first word of `text` is the name.
            let skip = usize::from(command.command.is_none());
            for word in command.text.split_whitespace().skip(skip) {
                responder.chunk(word).await?;
            }
            responder.end().await?;
        } else {
            responder.text(format!("echo: {}", command.text)).await?;
        }
        Ok(())
    }
}
