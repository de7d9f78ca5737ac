//! Broker client used by UIs: catalog queries, commands and service calls.

use futures::Stream;
use mist_config::{ClientConfig, LlmConfig, MistConfig};
use mist_protocol::{
    AgentRegistration, CatalogResponse, CommandPayload, CommandReply, Message, MessageType,
    ServiceRequest, ServiceResponse, StreamChunk, BROKER_ID,
};
use mist_transport::{Client, ClientState, ReplyStream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ClientError;

/// Default `sender` for UI clients.
pub const DEFAULT_SENDER: &str = "ui";

fn error_text(msg: &Message) -> String {
    msg.payload
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// Optional knobs for [`BrokerClient::llm_chat`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ChatOptions {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// A task as returned by the `tasks` service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskInfo {
    pub id: i64,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub due_date: Option<String>,
}

/// Client for the broker socket.
///
/// Every helper is built on [`Client::request`], so each call has its own
/// correlation id and deadline; concurrent calls never see each other's
/// replies.
pub struct BrokerClient {
    client: Client,
    config: ClientConfig,
    llm_timeout: Duration,
    sender: String,
}

impl BrokerClient {
    /// Connect to the socket named by `config`.
    pub async fn connect(config: &MistConfig) -> Result<Self, ClientError> {
        let client = Self::new(config.paths().socket_path(), config.client.clone())
            .with_llm_timeout(config.llm.timeout());
        client.client.connect().await?;
        Ok(client)
    }

    pub async fn connect_to(path: &Path, config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(path, config);
        client.client.connect().await?;
        Ok(client)
    }

    /// Connect and receive uncorrelated pushes from the broker on the
    /// returned channel.
    pub async fn connect_with_events(
        path: &Path,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), ClientError> {
        let client = Self::new(path, config);
        let events = client.client.subscribe_unsolicited();
        client.client.connect().await?;
        Ok((client, events))
    }

    fn new(path: impl Into<PathBuf>, config: ClientConfig) -> Self {
        Self {
            client: Client::new(path),
            config,
            llm_timeout: LlmConfig::default().timeout(),
            sender: DEFAULT_SENDER.to_string(),
        }
    }

    /// Deadline for [`BrokerClient::llm_chat`], which outlives ordinary
    /// service calls.
    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// Identify as `sender` in outgoing messages.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    /// The underlying transport client.
    pub fn transport(&self) -> &Client {
        &self.client
    }

    pub async fn close(&self) {
        self.client.close().await;
    }

    pub async fn wait_closed(&self) {
        self.client.wait_closed().await;
    }

    pub async fn request_catalog(&self) -> Result<Vec<AgentRegistration>, ClientError> {
        let msg = Message::create(MessageType::CatalogRequest, &self.sender, BROKER_ID, json!({}));
        let reply = self
            .client
            .request(msg, self.config.request_timeout())
            .await?;
        match reply.msg_type {
            MessageType::CatalogResponse => Ok(reply.payload_as::<CatalogResponse>()?.agents),
            MessageType::Error => Err(ClientError::Command(error_text(&reply))),
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    fn command(&self, agent_id: &str, text: &str) -> Result<Message, ClientError> {
        let payload = serde_json::to_value(CommandPayload::text(text))
            .map_err(mist_protocol::ProtocolError::Encode)?;
        Ok(Message::create(
            MessageType::Command,
            &self.sender,
            agent_id,
            payload,
        ))
    }

    /// Send `text` to `agent_id` and return the reply text.
    pub async fn send_command(&self, agent_id: &str, text: &str) -> Result<String, ClientError> {
        let msg = self.command(agent_id, text)?;
        debug!(agent_id, id = %msg.id, "sending command");
        let reply = self
            .client
            .request(msg, self.config.command_timeout())
            .await?;
        match reply.msg_type {
            MessageType::Response => {
                let reply: CommandReply = reply.payload_as()?;
                match reply.error {
                    Some(error) => Err(ClientError::Command(error)),
                    None => Ok(reply.text.unwrap_or_default()),
                }
            }
            MessageType::Error | MessageType::ServiceError => {
                Err(ClientError::Command(error_text(&reply)))
            }
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    /// Send `text` to `agent_id` and receive the reply incrementally.
    pub async fn send_command_stream(
        &self,
        agent_id: &str,
        text: &str,
    ) -> Result<CommandStream, ClientError> {
        let msg = self.command(agent_id, text)?;
        let replies = self.client.request_stream(&msg).await?;
        Ok(CommandStream {
            replies,
            timeout: self.config.command_timeout(),
            done: false,
        })
    }

    /// Call `service.action` on the broker and return its `result`.
    pub async fn request_service(
        &self,
        service: &str,
        action: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.call_service(service, action, params, self.config.service_timeout())
            .await
    }

    async fn call_service(
        &self,
        service: &str,
        action: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let request = ServiceRequest::new(service, action, params.unwrap_or_else(|| json!({})));
        let payload =
            serde_json::to_value(&request).map_err(mist_protocol::ProtocolError::Encode)?;
        let msg = Message::create(MessageType::ServiceRequest, &self.sender, BROKER_ID, payload);
        debug!(service, action, id = %msg.id, "service request");

        let reply = self.client.request(msg, timeout).await?;
        match reply.msg_type {
            MessageType::ServiceResponse => Ok(reply.payload_as::<ServiceResponse>()?.result),
            MessageType::ServiceError | MessageType::Error => {
                Err(ClientError::Service(error_text(&reply)))
            }
            other => Err(ClientError::UnexpectedReply(other.to_string())),
        }
    }

    pub async fn llm_chat(&self, prompt: &str, options: ChatOptions) -> Result<String, ClientError> {
        let mut params = match serde_json::to_value(options) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        params.insert("prompt".to_string(), Value::String(prompt.to_string()));
        match self
            .call_service("llm", "chat", Some(Value::Object(params)), self.llm_timeout)
            .await?
        {
            Value::String(text) => Ok(text),
            other => Err(ClientError::UnexpectedReply(format!("llm result {}", other))),
        }
    }

    /// Create a task and return its id.
    pub async fn create_task(&self, title: &str, due_date: Option<&str>) -> Result<i64, ClientError> {
        let mut params = json!({ "title": title });
        if let Some(date) = due_date {
            params["due_date"] = json!(date);
        }
        let result = self.request_service("tasks", "create", Some(params)).await?;
        result
            .get("task_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ClientError::UnexpectedReply(format!("tasks.create result {}", result)))
    }

    pub async fn list_tasks(&self, include_done: bool) -> Result<Vec<TaskInfo>, ClientError> {
        let result = self
            .request_service("tasks", "list", Some(json!({ "include_done": include_done })))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ClientError::UnexpectedReply(format!("tasks.list result: {}", e)))
    }
}

/// Incremental reply to a command: each `stream.chunk` text, then the end.
///
/// A plain `response` is accepted as a single final item, so agents that do
/// not stream still work.
pub struct CommandStream {
    replies: ReplyStream,
    timeout: Duration,
    done: bool,
}

impl CommandStream {
    pub async fn next(&mut self) -> Option<Result<String, ClientError>> {
        if self.done {
            return None;
        }
        let msg = match self.replies.next_timeout(self.timeout).await {
            Ok(msg) => msg,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        if msg.msg_type != MessageType::StreamChunk {
            self.done = true;
        }

        match msg.msg_type {
            MessageType::StreamChunk => {
                Some(msg.payload_as::<StreamChunk>().map(|c| c.text).map_err(Into::into))
            }
            MessageType::StreamEnd => None,
            MessageType::Response => match msg.payload_as::<CommandReply>() {
                Ok(CommandReply {
                    error: Some(error), ..
                }) => Some(Err(ClientError::Command(error))),
                Ok(CommandReply { text, .. }) => text.map(Ok),
                Err(e) => Some(Err(e.into())),
            },
            MessageType::Error | MessageType::ServiceError => {
                Some(Err(ClientError::Command(error_text(&msg))))
            }
            other => Some(Err(ClientError::UnexpectedReply(other.to_string()))),
        }
    }

    /// Every item as one `Vec`, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<Vec<String>, ClientError> {
        let mut parts = Vec::new();
        while let Some(item) = self.next().await {
            parts.push(item?);
        }
        Ok(parts)
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<String, ClientError>> + Send {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}
