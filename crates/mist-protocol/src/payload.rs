//! Typed views of the payloads carried by each message type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::AgentRegistration;

/// Payload of `service.request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

impl ServiceRequest {
    pub fn new(service: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            params,
        }
    }

    /// Params as an object; `null` and absent params read as empty.
    pub fn params_object(&self) -> serde_json::Map<String, Value> {
        match &self.params {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// Payload of `service.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub result: Value,
}

/// Payload of `service.error` and `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Payload of `command` and `agent.message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl CommandPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command: None,
            args: None,
        }
    }

    /// Name of the invoked command: the explicit `command` field, or the
    /// first word of `text`.
    pub fn command_name(&self) -> Option<&str> {
        self.command
            .as_deref()
            .or_else(|| self.text.split_whitespace().next())
    }
}

/// Payload of `response`. Exactly one of `text` or `error` is normally set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            text: None,
            error: Some(error.into()),
        }
    }
}

/// Payload of `stream.chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
}

/// Payload of `agent.ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub agent_id: String,
}

/// Payload of `agent.catalog`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub agents: Vec<AgentRegistration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_request_params_default() {
        let req: ServiceRequest =
            serde_json::from_value(json!({"service": "tasks", "action": "list"})).unwrap();
        assert!(req.params.is_null());
        assert!(req.params_object().is_empty());
    }

    #[test]
    fn test_service_request_requires_service() {
        let err = serde_json::from_value::<ServiceRequest>(json!({"action": "list"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_command_reply_skips_empty_fields() {
        let value = serde_json::to_value(CommandReply::text("echo: hi")).unwrap();
        assert_eq!(value, json!({"text": "echo: hi"}));
        let value = serde_json::to_value(CommandReply::error("unknown agent: x")).unwrap();
        assert_eq!(value, json!({"error": "unknown agent: x"}));
    }

    #[test]
    fn test_command_name() {
        let plain = CommandPayload::text("summarize today please");
        assert_eq!(plain.command_name(), Some("summarize"));

        let explicit = CommandPayload {
            text: "whatever".into(),
            command: Some("search".into()),
            args: None,
        };
        assert_eq!(explicit.command_name(), Some("search"));

        assert_eq!(CommandPayload::text("   ").command_name(), None);
    }
}
